//! Enter/exit bodies of the seven workflow states.
//!
//! Each state is an ordinary pair of async functions running on the worker
//! task. Blocking waits are polling loops that consult `force_stop` (and
//! `exit` where the contract demands it) at every sleep boundary; there is
//! no preemption.

pub(crate) mod automatic_cycling;
pub(crate) mod holding;
pub(crate) mod idle;
pub(crate) mod initializing_valves;
pub(crate) mod relief;
pub(crate) mod starting_vfd;
pub(crate) mod stopping;

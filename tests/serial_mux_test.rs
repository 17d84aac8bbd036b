//! Exercises the serial multiplexer over a fake bus: transaction
//! serialization, lock release on injected faults, and register scaling.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use torr::TorrError;
use torr::serial::{ModbusPort, SerialCom};

#[derive(Clone, Default)]
struct BusState {
    registers: HashMap<(u8, u16), u16>,
}

/// Fake transport that records overlapping exchanges and injected faults.
struct FakePort {
    busy: Arc<AtomicBool>,
    overlap: Arc<AtomicBool>,
    state: Arc<Mutex<BusState>>,
    fail_slave: Option<u8>,
    delay: Duration,
}

impl FakePort {
    fn new(fail_slave: Option<u8>, delay: Duration) -> (Self, Arc<AtomicBool>, Arc<Mutex<BusState>>) {
        let overlap = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Mutex::new(BusState::default()));
        (
            Self {
                busy: Arc::new(AtomicBool::new(false)),
                overlap: Arc::clone(&overlap),
                state: Arc::clone(&state),
                fail_slave,
                delay,
            },
            overlap,
            state,
        )
    }

    async fn exchange<T>(
        &self,
        slave: u8,
        op: impl FnOnce(&mut BusState) -> T,
    ) -> torr::Result<T> {
        // An exchange beginning while another is in flight means the
        // multiplexer let frames interleave.
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlap.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(self.delay).await;

        let result = if Some(slave) == self.fail_slave {
            Err(TorrError::serial("injected bus fault"))
        } else {
            Ok(op(&mut self.state.lock().unwrap()))
        };

        self.busy.store(false, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl ModbusPort for FakePort {
    async fn read_coils(&mut self, slave: u8, address: u16, count: u16) -> torr::Result<Vec<bool>> {
        self.exchange(slave, |state| {
            (0..count)
                .map(|i| state.registers.get(&(slave, address + i)).copied().unwrap_or(0) != 0)
                .collect()
        })
        .await
    }

    async fn read_holding_registers(
        &mut self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> torr::Result<Vec<u16>> {
        self.exchange(slave, |state| {
            (0..count)
                .map(|i| state.registers.get(&(slave, address + i)).copied().unwrap_or(0))
                .collect()
        })
        .await
    }

    async fn read_input_registers(
        &mut self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> torr::Result<Vec<u16>> {
        self.read_holding_registers(slave, address, count).await
    }

    async fn write_single_register(
        &mut self,
        slave: u8,
        address: u16,
        value: u16,
    ) -> torr::Result<()> {
        self.exchange(slave, |state| {
            state.registers.insert((slave, address), value);
        })
        .await
    }

    async fn write_multiple_registers(
        &mut self,
        slave: u8,
        address: u16,
        values: &[u16],
    ) -> torr::Result<()> {
        let values = values.to_vec();
        self.exchange(slave, move |state| {
            for (i, value) in values.iter().enumerate() {
                state.registers.insert((slave, address + i as u16), *value);
            }
        })
        .await
    }
}

#[tokio::test]
async fn concurrent_calls_are_serialized() {
    let (port, overlap, state) = FakePort::new(None, Duration::from_millis(50));
    state
        .lock()
        .unwrap()
        .registers
        .extend([((2, 1028), 0x41F0), ((2, 1029), 0x0000)]); // 30.0f32

    let serial = Arc::new(SerialCom::with_port(Box::new(port)));

    let reader = {
        let serial = Arc::clone(&serial);
        tokio::spawn(async move { serial.read_float(2, 1028, 2).await })
    };
    let writer = {
        let serial = Arc::clone(&serial);
        tokio::spawn(async move { serial.write_register(1, 8193, 30.0, 2, 6, false).await })
    };

    let read = reader.await.unwrap().unwrap();
    writer.await.unwrap().unwrap();

    assert!((read - 30.0).abs() < 1e-6);
    assert!(!overlap.load(Ordering::SeqCst), "exchanges interleaved");
    // 30.00 Hz scaled by two decimals lands as 3000
    assert_eq!(state.lock().unwrap().registers.get(&(1, 8193)), Some(&3000));
}

#[tokio::test]
async fn fault_releases_the_bus_for_the_next_caller() {
    let (port, overlap, state) = FakePort::new(Some(5), Duration::from_millis(5));
    state.lock().unwrap().registers.insert((2, 100), 7);

    let serial = SerialCom::with_port(Box::new(port));

    let err = serial.read_registers(5, 100, 1, 3).await.unwrap_err();
    assert!(matches!(err, TorrError::Serial { .. }));

    // The mutex was released on the error path; the bus still answers
    let regs = serial.read_registers(2, 100, 1, 3).await.unwrap();
    assert_eq!(regs, vec![7]);
    assert!(!overlap.load(Ordering::SeqCst));
}

#[tokio::test]
async fn function_codes_dispatch_and_validate() {
    let (port, _overlap, state) = FakePort::new(None, Duration::from_millis(1));
    state
        .lock()
        .unwrap()
        .registers
        .extend([((3, 10), 1), ((3, 8451), 0x0000), ((3, 8452), 1750)]);

    let serial = SerialCom::with_port(Box::new(port));

    // fc 1 reads a coil as 0/1
    let coil = serial.read_register(3, 10, 0, 1).await.unwrap();
    assert!((coil - 1.0).abs() < f64::EPSILON);

    // fc 3 wide read feeds the u32 speed decoding path (17.50 Hz)
    let regs = serial.read_registers(3, 8451, 2, 3).await.unwrap();
    assert_eq!(regs, vec![0, 1750]);

    // unsupported function codes are rejected before touching the bus
    let err = serial.read_registers(3, 10, 1, 9).await.unwrap_err();
    assert!(matches!(err, TorrError::Validation { .. }));
    let err = serial
        .write_register(3, 10, 1.0, 0, 5, false)
        .await
        .unwrap_err();
    assert!(matches!(err, TorrError::Validation { .. }));
}

#[tokio::test]
async fn scaled_and_multi_register_writes_land() {
    let (port, _overlap, state) = FakePort::new(None, Duration::from_millis(1));
    let serial = SerialCom::with_port(Box::new(port));

    // write_register with decimals and fc 16
    serial.write_register(4, 200, 1.5, 1, 16, false).await.unwrap();
    assert_eq!(state.lock().unwrap().registers.get(&(4, 200)), Some(&15));

    // float write spans two registers
    serial.write_float(4, 300, 1.0).await.unwrap();
    {
        let state = state.lock().unwrap();
        assert_eq!(state.registers.get(&(4, 300)), Some(&0x3F80));
        assert_eq!(state.registers.get(&(4, 301)), Some(&0x0000));
    }

    // out-of-range scaled values are refused client-side
    assert!(serial.write_register(4, 200, 700.0, 2, 6, false).await.is_err());
}

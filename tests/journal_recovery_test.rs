//! Walks the journal through the commit sequence of a cyclic test and the
//! recovery paths an operator relies on after a crash.

use serde_json::json;
use torr::journal::{Journal, JournalRecord};

#[test]
fn cyclic_commit_sequence_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("variables.json");

    // Test accepted: command journaled, resume raised
    let mut journal = Journal::open(&path);
    let command = json!({
        "command": "start", "mode": "cyclic", "sensor_id": "1",
        "positive": 100.0, "negative": 10.0, "cycles": 3, "test_index": 7
    });
    journal.update(|r| r.command = command.clone()).unwrap();
    journal.update(|r| r.resume = true).unwrap();

    // Cycles 0 and 1 committed; the process dies here
    journal.update(|r| r.cycle_index = 0).unwrap();
    journal.update(|r| r.cycle_index = 1).unwrap();
    drop(journal);

    // Restart: the journal offers the interrupted test back
    let mut journal = Journal::open(&path);
    assert!(journal.record().resume);
    assert_eq!(journal.record().cycle_index, 1);
    assert_eq!(journal.record().command, command);

    // Remaining cycles complete: index committed, slate wiped
    journal.update(|r| r.cycle_index = 2).unwrap();
    journal.update(|r| r.current_test_index = 7).unwrap();
    journal.update(|r| r.cycle_index = 0).unwrap();
    journal.update(|r| r.resume = false).unwrap();
    drop(journal);

    let journal = Journal::open(&path);
    assert!(!journal.record().resume);
    assert_eq!(journal.record().cycle_index, 0);
    assert_eq!(journal.record().current_test_index, 7);
}

#[test]
fn resume_cancel_wipes_progress() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("variables.json");

    let mut journal = Journal::open(&path);
    journal
        .update(|r| {
            r.resume = true;
            r.command = json!({"command": "start", "mode": "cyclic"});
            r.cycle_index = 2;
            r.current_test_index = 5;
        })
        .unwrap();

    journal
        .update(|r| {
            r.resume = false;
            r.command = json!({});
            r.current_test_index = 0;
            r.cycle_index = 0;
        })
        .unwrap();
    drop(journal);

    let journal = Journal::open(&path);
    assert_eq!(*journal.record(), JournalRecord::default());
}

#[test]
fn truncated_file_recovers_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("variables.json");

    // A torn direct write (the failure mode the temp-file rename prevents)
    std::fs::write(&path, r#"{"resume": true, "cycle_ind"#).unwrap();

    let journal = Journal::open(&path);
    assert_eq!(*journal.record(), JournalRecord::default());
}

#[test]
fn user_inputs_persist_independently_of_progress() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("variables.json");

    let mut journal = Journal::open(&path);
    let inputs = json!({"setpoint": 50.0, "holdtime": 2});
    journal.update(|r| r.current_inputs = inputs.clone()).unwrap();
    journal.update(|r| r.cycle_index = 1).unwrap();
    drop(journal);

    let journal = Journal::open(&path);
    assert_eq!(journal.record().current_inputs, inputs);
    assert_eq!(journal.record().cycle_index, 1);
}

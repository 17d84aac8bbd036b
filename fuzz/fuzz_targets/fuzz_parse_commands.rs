#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Both command surfaces must reject arbitrary payloads without panicking
    let _ = torr::vfd::VfdCommand::parse(data);

    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) {
        let _ = torr::statemachine::types::parse_command(&value);
    }
});

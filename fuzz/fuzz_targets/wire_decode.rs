#![no_main]

use libfuzzer_sys::fuzz_target;
use testhost_core::wire::{self, AgentMessage, HostMessage};
use testhost_core::{DiscoveredTestRecord, TestOutcomeRecord};

fuzz_target!(|data: &[u8]| {
    // Convert bytes to UTF-8 string (ignore invalid UTF-8)
    if let Ok(line) = std::str::from_utf8(data) {
        // Both directions of the channel must reject garbage without panicking
        let _ = wire::decode::<HostMessage>(line);
        if let Ok(AgentMessage::Progress { args }) = wire::decode::<AgentMessage>(line) {
            // Progress payloads are re-hydrated on the host side
            let _ = DiscoveredTestRecord::from_args(&args);
            let _ = TestOutcomeRecord::from_args(&args);
        }
    }
});

//! Fuzz target for retry job parsing.
//!
//! `RetryJob::from_payload` must never panic on arbitrary JSON - malformed
//! payloads come straight off the topic bus.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mirror_engine::RetryJob;

fuzz_target!(|data: &[u8]| {
    if let Ok(payload) = serde_json::from_slice::<serde_json::Value>(data) {
        // Should never panic
        let _ = RetryJob::from_payload(&payload);
    }
});

//! Fuzz target for dispatch dueness arithmetic.
//!
//! `DispatchEntry::is_due` must never panic, whatever timestamps and delays
//! the store hands back (including hostile clock values).

#![no_main]

use libfuzzer_sys::fuzz_target;
use mirror_engine::DispatchEntry;

fuzz_target!(|data: (i64, Option<i64>, Option<u32>, u32)| {
    let (now, enqueued_at, delay_minutes, retry_count) = data;
    let entry = DispatchEntry {
        id: "0".to_string(),
        topic: "t".to_string(),
        payload: serde_json::Value::Null,
        delay_minutes,
        retry_count,
        enqueued_at,
    };

    // Should never panic
    let _ = entry.is_due(now);
    let _ = entry.is_well_formed();
});

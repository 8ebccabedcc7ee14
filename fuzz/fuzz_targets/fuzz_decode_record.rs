// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for message payload decoding.
//!
//! Decoding must never panic, and a record that decodes again after a
//! re-encode keeps its key and payment id.

#![no_main]

use libfuzzer_sys::fuzz_target;
use order_replication::{Decoded, RecordCodec};

fuzz_target!(|data: &[u8]| {
    let Ok(Decoded::Record(record)) = RecordCodec::decode(data) else {
        return;
    };

    let Ok(encoded) = RecordCodec::encode(&record) else {
        return;
    };
    if let Ok(Decoded::Record(again)) = RecordCodec::decode(&encoded) {
        assert_eq!(RecordCodec::key(&again), RecordCodec::key(&record));
        assert_eq!(again.payment_id, record.payment_id);
    }
});

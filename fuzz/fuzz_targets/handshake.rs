//! Fuzz target for handshake parsing
//!
//! Feeds arbitrary bytes to the length-prefixed handshake reader and the
//! record decoder. Both must return Ok or Err, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_relay::{PeerToRelay, read_handshake};

fuzz_target!(|data: &[u8]| {
    let _ = PeerToRelay::from_bytes(data);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let mut reader = data;
    if let Ok(message) = runtime.block_on(read_handshake(&mut reader, 1024)) {
        // A decoded record never re-encodes longer than the bytes it came from
        let frame = message.encode_frame().expect("decoded record re-encodes");
        assert!(frame.len() <= data.len() - reader.len());
    }
});

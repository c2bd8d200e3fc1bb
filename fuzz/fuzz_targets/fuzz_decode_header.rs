//! Fuzz the compact event-header decoder: arbitrary bytes must never panic,
//! and anything that decodes must survive a canonical re-encode round trip.

#![no_main]

use libfuzzer_sys::fuzz_target;

use clotho::event::codec::{decode_header, encode_header};

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = decode_header(data) {
        let canonical = encode_header(&header);
        let again = decode_header(&canonical).expect("canonical form must decode");
        assert_eq!(header, again);
    }
});

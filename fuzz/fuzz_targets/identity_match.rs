//! Fuzz target for identity matching
//!
//! Checks that matching is symmetric and that empty secrets never match.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tether_relay::Identity;

#[derive(Debug, Arbitrary)]
struct Input {
    key_a: u32,
    key_b: u32,
    secret_a: Vec<u8>,
    secret_b: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let a_empty = input.secret_a.is_empty();
    let a = Identity::new(input.key_a, input.secret_a);
    let b = Identity::new(input.key_b, input.secret_b);

    assert_eq!(a.is_peer_of(&b), b.is_peer_of(&a));
    if a_empty {
        assert!(!a.is_peer_of(&b));
    }
});

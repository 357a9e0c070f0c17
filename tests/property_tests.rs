//! Property-based tests for the TETHER relay
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Identity Matching Properties
// ============================================================================

mod identity_properties {
    use super::*;
    use tether_relay::Identity;

    proptest! {
        /// Matching is symmetric
        #[test]
        fn peer_relation_is_symmetric(
            key_a in any::<u32>(),
            key_b in any::<u32>(),
            secret_a in prop::collection::vec(any::<u8>(), 0..32),
            secret_b in prop::collection::vec(any::<u8>(), 0..32),
        ) {
            let a = Identity::new(key_a, secret_a);
            let b = Identity::new(key_b, secret_b);
            prop_assert_eq!(a.is_peer_of(&b), b.is_peer_of(&a));
        }

        /// Two identities match exactly when both fields are equal and the secret is non-empty
        #[test]
        fn peer_relation_requires_full_equality(
            key_a in 0u32..4,
            key_b in 0u32..4,
            secret_a in prop::collection::vec(0u8..3, 0..3),
            secret_b in prop::collection::vec(0u8..3, 0..3),
        ) {
            let expected = key_a == key_b && secret_a == secret_b && !secret_a.is_empty();
            let a = Identity::new(key_a, secret_a);
            let b = Identity::new(key_b, secret_b);
            prop_assert_eq!(a.is_peer_of(&b), expected);
        }

        /// An identity matches a copy of itself unless its secret is empty
        #[test]
        fn self_match_depends_on_secret(
            key in any::<u32>(),
            secret in prop::collection::vec(any::<u8>(), 0..64),
        ) {
            let a = Identity::new(key, secret.clone());
            let b = Identity::new(key, secret.clone());
            prop_assert_eq!(a.is_peer_of(&b), !secret.is_empty());
        }

        /// Fingerprints never reveal the secret bytes
        #[test]
        fn fingerprint_is_fixed_width(
            key in any::<u32>(),
            secret in prop::collection::vec(any::<u8>(), 1..64),
        ) {
            let fingerprint = Identity::new(key, secret).fingerprint();
            prop_assert_eq!(fingerprint.len(), 8);
            prop_assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}

// ============================================================================
// Handshake Parsing Properties
// ============================================================================

mod handshake_properties {
    use super::*;
    use tether_relay::{PeerToRelay, RelayError, read_handshake};

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    proptest! {
        /// The handshake consumes exactly its frame; relayed payload stays in the stream
        #[test]
        fn handshake_leaves_payload_untouched(
            key in any::<u32>(),
            secret in prop::collection::vec(any::<u8>(), 1..128),
            payload in prop::collection::vec(any::<u8>(), 0..256),
        ) {
            let mut bytes = PeerToRelay::new(key, secret.clone()).encode_frame().unwrap();
            bytes.extend_from_slice(&payload);

            let mut reader = &bytes[..];
            let message = block_on(read_handshake(&mut reader, 1024)).unwrap();

            prop_assert_eq!(message.key_id, key);
            prop_assert_eq!(&message.secret, &secret);
            prop_assert_eq!(reader, &payload[..]);
        }

        /// Arbitrary input never panics the reader
        #[test]
        fn arbitrary_input_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
            let mut reader = &bytes[..];
            let _ = block_on(read_handshake(&mut reader, 256));
        }

        /// Declared lengths above capacity are rejected before the body is read
        #[test]
        fn oversized_length_rejected(capacity in 1usize..4096, excess in 1u32..10_000) {
            let length = capacity as u32 + excess;
            let bytes = length.to_be_bytes();
            let mut reader = &bytes[..];

            let result = block_on(read_handshake(&mut reader, capacity));
            let is_invalid_length = matches!(
                result,
                Err(RelayError::InvalidLength { length: l, capacity: c }) if l == length && c == capacity
            );
            prop_assert!(is_invalid_length);
        }

        /// Bodies with trailing garbage inside the declared length are rejected
        #[test]
        fn trailing_body_bytes_rejected(
            key in any::<u32>(),
            secret in prop::collection::vec(any::<u8>(), 1..32),
            garbage in prop::collection::vec(any::<u8>(), 1..16),
        ) {
            let mut body = PeerToRelay::new(key, secret).to_bytes().unwrap();
            body.extend_from_slice(&garbage);
            prop_assert!(PeerToRelay::from_bytes(&body).is_err());
        }
    }
}

// ============================================================================
// Relay Fidelity Properties
// ============================================================================

mod relay_properties {
    use super::*;
    use tether_integration_tests::fixtures::RelayFixture;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// Whatever chunking the sender uses, the receiver sees the same bytes in order
        #[test]
        fn relay_preserves_byte_stream(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..2048), 1..24),
        ) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            let (forward, backward) = runtime.block_on(async {
                let fixture = RelayFixture::new().await.unwrap();
                let (mut first, mut second) = fixture.connect_pair(99, b"fidelity").await.unwrap();

                let expected: Vec<u8> = chunks.concat();
                let total = expected.len();

                let writer_chunks = chunks.clone();
                let send = async {
                    for chunk in &writer_chunks {
                        first.write_all(chunk).await.unwrap();
                    }
                };
                let mut forward = vec![0u8; total];
                let recv = second.read_exact(&mut forward);
                let (_, read) = tokio::join!(send, recv);
                read.unwrap();

                let reversed: Vec<u8> = expected.iter().rev().copied().collect();
                let mut backward = vec![0u8; total];
                let (sent, read) = tokio::join!(
                    second.write_all(&reversed),
                    first.read_exact(&mut backward)
                );
                sent.unwrap();
                read.unwrap();
                backward.reverse();

                fixture.cleanup().await;
                (forward, backward)
            });

            let expected: Vec<u8> = chunks.concat();
            prop_assert_eq!(&forward, &expected);
            prop_assert_eq!(&backward, &expected);
        }
    }
}

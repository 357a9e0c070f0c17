//! Relay test fixtures

mod relay;

pub use relay::{RecordingDelegate, RelayFixture};

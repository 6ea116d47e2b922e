//! Shared fixtures for `wirelink` tests.
//!
//! Provides test messages with fixed type tags, an echo router, helpers for
//! speaking the default wire format over raw sockets, a serialised handle to
//! the global log capture and a `DebuggingRecorder` setup for metrics.
//!
//! ```rust
//! use wirelink_testing::{Chat, encode_frame};
//!
//! let frame = encode_frame(&Chat::new("hi"));
//! assert_eq!(&frame[..4], &7u32.to_be_bytes());
//! ```

mod frames;
mod logging;
mod messages;
mod metrics;
mod net;

pub use frames::{encode_frame, raw_frame, read_frame, read_message};
pub use logging::{LoggerHandle, logger};
pub use messages::{Chat, Tick, echo_router};
pub use metrics::{counter_value, debugging_recorder_setup};
pub use net::{bind_local, free_listener, wait_until};

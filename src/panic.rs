//! Utilities for working with panic payloads.
//!
//! Connection loops, worker tasks and timer callbacks run user code. A panic
//! there must not take down the runtime or leak the connection, so those
//! futures are driven through [`catch_panic`] and the payload is logged via
//! [`PanicMessage`].

use std::{any::Any, fmt, future::Future, panic::AssertUnwindSafe};

use futures::FutureExt;

/// Wrapper that formats a panic payload when logged or displayed.
///
/// The payload is downcast to `String` or `&'static str` if possible and falls
/// back to `Debug` formatting otherwise.
///
/// ```
/// use wirelink::panic::format_panic;
/// assert_eq!(format_panic(Box::new("boom")).to_string(), "boom");
/// assert_eq!(
///     format_panic(Box::new(String::from("boom"))).to_string(),
///     "boom"
/// );
/// assert!(format_panic(Box::new(5_u32)).to_string().contains("Any"));
/// ```
#[derive(Debug)]
#[must_use]
pub struct PanicMessage(Box<dyn Any + Send>);

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.0.downcast_ref::<String>() {
            f.write_str(s)
        } else if let Some(s) = self.0.downcast_ref::<&'static str>() {
            f.write_str(s)
        } else {
            write!(f, "{:?}", self.0)
        }
    }
}

/// Create a [`PanicMessage`] for the given payload.
pub fn format_panic(panic: Box<dyn Any + Send>) -> PanicMessage { PanicMessage(panic) }

/// Drive `fut` to completion, converting a panic into a [`PanicMessage`].
///
/// # Errors
///
/// Returns the formatted payload if `fut` panicked.
///
/// ```
/// use wirelink::panic::catch_panic;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// assert_eq!(catch_panic(async { 3 }).await.ok(), Some(3));
/// let err = catch_panic(async { panic!("boom") }).await.unwrap_err();
/// assert_eq!(err.to_string(), "boom");
/// # }
/// ```
pub async fn catch_panic<F>(fut: F) -> Result<F::Output, PanicMessage>
where
    F: Future,
{
    AssertUnwindSafe(fut).catch_unwind().await.map_err(format_panic)
}

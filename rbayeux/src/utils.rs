use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};

use futures::FutureExt;

pub use rbayeux_utils::{format_timestamp_millis, timestamp_millis, timestamp_secs};

/// Runs `f`, turning a panic into `Err(panic message)`.
#[inline]
pub(crate) fn catch<R, F: FnOnce() -> R>(f: F) -> Result<R, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(panic_message)
}

/// Async counterpart of [`catch`].
#[inline]
pub(crate) async fn catch_async<R, F: Future<Output = R>>(f: F) -> Result<R, String> {
    AssertUnwindSafe(f).catch_unwind().await.map_err(panic_message)
}

fn panic_message(e: Box<dyn Any + Send>) -> String {
    if let Some(s) = e.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = e.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

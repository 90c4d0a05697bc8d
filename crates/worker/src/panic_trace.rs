//! Backtrace capture for panics caught by the handler.
//!
//! A backtrace is only available inside the panic hook, so [`install`]
//! registers a hook that stores it in a thread-local. The handler's
//! `catch_unwind` runs on the panicking thread and picks it up with
//! [`take_backtrace`].

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::sync::Once;

use faceswap_core::result::JobResult;

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

/// Install the recording panic hook. Later calls are no-ops.
pub fn install() {
    INSTALL.call_once(|| {
        std::panic::set_hook(Box::new(|info| {
            let backtrace = Backtrace::force_capture().to_string();
            tracing::error!(panic = %info, backtrace = %backtrace, "Unhandled panic");
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
        }));
    });
}

/// Backtrace of the most recent panic on this thread, if the hook saw one.
pub fn take_backtrace() -> Option<String> {
    LAST_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

/// Human-readable message carried by a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Error result for a panic caught around the handler.
pub fn panic_result(payload: Box<dyn Any + Send>) -> JobResult {
    let result = JobResult::error(panic_message(payload.as_ref()));
    match take_backtrace() {
        Some(backtrace) => result.with_traceback(backtrace),
        None => result,
    }
}

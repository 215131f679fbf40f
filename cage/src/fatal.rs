//! Fatal failure paths.
//!
//! Invariant violations and out-of-memory conditions are never recovered
//! from. Both end in a panic, which the release profile turns into an abort.

use std::sync::OnceLock;

pub type OomHandler = fn(what: &'static str);

static OOM_HANDLER: OnceLock<OomHandler> = OnceLock::new();

/// Installs the process-wide out-of-memory hook. Only the first call wins.
pub fn set_oom_handler(handler: OomHandler) -> bool {
    OOM_HANDLER.set(handler).is_ok()
}

#[cold]
#[inline(never)]
pub fn fatal_oom(what: &'static str) -> ! {
    log::error!("fatal out of memory: {what}");
    if let Some(handler) = OOM_HANDLER.get() {
        handler(what);
    }
    panic!("fatal out of memory: {what}");
}

#[cold]
#[inline(never)]
pub fn fatal(message: std::fmt::Arguments<'_>) -> ! {
    log::error!("fatal check failed: {message}");
    panic!("fatal check failed: {message}");
}

/// Unconditional invariant check, kept in release builds.
#[macro_export]
macro_rules! fatal_check {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::fatal::fatal(format_args!($($arg)+));
        }
    };
}

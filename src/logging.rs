//! Logging macros with automatic file:line injection
//!
//! Thin wrappers over the `log` crate so every line can be traced back to its
//! call site without a debugger attached.
//!
//! Format: `[file:line] message`
//!
//! ```text
//! info!("ota::pipeline: Streaming firmware into {}", slot.label);
//! // [src/ota/pipeline.rs:88] ota::pipeline: Streaming firmware into ota_1
//! ```

/// Shared body: `file!`/`line!` resolve to the outermost call site
macro_rules! log_at {
    ($level:ident, $($arg:tt)*) => {
        {
            const LOC: &str = concat!("[", file!(), ":", line!(), "]");
            ::log::$level!("{} {}", LOC, format_args!($($arg)*))
        }
    };
}

macro_rules! info {
    ($($arg:tt)*) => { log_at!(info, $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { log_at!(warn, $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { log_at!(error, $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { log_at!(debug, $($arg)*) };
}

/// Digests and other bulky detail
macro_rules! trace {
    ($($arg:tt)*) => { log_at!(trace, $($arg)*) };
}

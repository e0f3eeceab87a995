pub use log;

/// Logging macros gated on cargo features so that hot paths compile to
/// nothing in benchmark and release builds. `log_error!` is always live.

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logger::log::error!($($arg)*)
    };
}

#[cfg(feature = "log_warn")]
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logger::log::warn!($($arg)*)
    };
}

#[cfg(not(feature = "log_warn"))]
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if false {
            let _ = format_args!($($arg)*);
        }
    };
}

#[cfg(feature = "log_info")]
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logger::log::info!($($arg)*)
    };
}

#[cfg(not(feature = "log_info"))]
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if false {
            let _ = format_args!($($arg)*);
        }
    };
}

#[cfg(feature = "log_debug")]
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logger::log::debug!($($arg)*)
    };
}

#[cfg(not(feature = "log_debug"))]
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if false {
            let _ = format_args!($($arg)*);
        }
    };
}

#[cfg(feature = "log_trace")]
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        $crate::logger::log::trace!($($arg)*)
    };
}

#[cfg(not(feature = "log_trace"))]
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        if false {
            let _ = format_args!($($arg)*);
        }
    };
}

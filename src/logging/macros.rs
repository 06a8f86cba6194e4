// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logging macros
//
// Each takes a logger, a facility and either a message expression or a
// format string with arguments:
//
//     log_debug!(logger, Facility::Assert, &msg);
//     log_debug!(logger, Facility::Assert, "{} assert timer restarted", sg);

#[doc(hidden)]
#[macro_export]
macro_rules! __pim_log {
    ($method:ident, $logger:expr, $facility:expr, $fmt:literal, $($arg:tt)+) => {
        $logger.$method($facility, &format!($fmt, $($arg)+))
    };
    ($method:ident, $logger:expr, $facility:expr, $msg:expr) => {
        $logger.$method($facility, $msg)
    };
}

#[macro_export]
macro_rules! log_critical {
    ($($t:tt)+) => { $crate::__pim_log!(critical, $($t)+) };
}

#[macro_export]
macro_rules! log_error {
    ($($t:tt)+) => { $crate::__pim_log!(error, $($t)+) };
}

#[macro_export]
macro_rules! log_warning {
    ($($t:tt)+) => { $crate::__pim_log!(warning, $($t)+) };
}

#[macro_export]
macro_rules! log_notice {
    ($($t:tt)+) => { $crate::__pim_log!(notice, $($t)+) };
}

#[macro_export]
macro_rules! log_info {
    ($($t:tt)+) => { $crate::__pim_log!(info, $($t)+) };
}

/// Debug output; the message is only formatted when it will be written
#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $facility:expr, $($t:tt)+) => {{
        let logger = &$logger;
        let facility = $facility;
        if logger.debug_enabled(facility) {
            $crate::__pim_log!(debug, logger, facility, $($t)+)
        }
    }};
}

/// Log with key-value context attached to the entry
///
/// ```ignore
/// log_kv!(logger, Severity::Info, Facility::Oil, "oif added",
///         "sg" => "(10.0.0.1,239.1.1.1)", "vif" => "3");
/// ```
#[macro_export]
macro_rules! log_kv {
    ($logger:expr, $severity:expr, $facility:expr, $msg:expr, $($key:expr => $value:expr),+) => {{
        let kvs: &[(&str, &str)] = &[$(($key, $value)),+];
        $logger.log_kv($severity, $facility, $msg, kvs)
    }};
}

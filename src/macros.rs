//! General purpose macros for diagnostic output.
//!
//! Messages carry an optional 'context' tag naming the subsystem that
//! produced them, inserted at the beginning of the line. Output goes to
//! stderr so that tools piping an image through stdout stay clean.

/// Prints a standard information message to the diagnostic output.
///
/// You can specify a 'context' as the first argument when calling the
/// macro, which will be inserted at the beginning of the message.
///
/// # Examples
///
/// ```
/// use chickadeefs::info;
///
/// info!("bufcache", "slot table initialized");
/// ```
#[macro_export]
macro_rules! info {
    // A context was provided, so we insert it at the beginning of
    // the message.
    ($ctx: literal, $($arg: tt)*) => {
        eprintln!("[info] {}: {}", $ctx, format_args!($($arg)*))
    };
    ($($arg: tt)*) => {
        eprintln!("[info] {}", format_args!($($arg)*))
    };
}

/// Prints a standard error message to the diagnostic output.
///
/// You can specify a 'context' as the first argument when calling the
/// macro, which will be inserted at the beginning of the error message.
///
/// # Examples
///
/// ```
/// use chickadeefs::error;
///
/// error!("bufcache", "no room for block 42");
/// ```
#[macro_export]
macro_rules! error {
    // A context was provided, so we insert it at the beginning of
    // the message.
    ($ctx: literal, $($arg: tt)*) => {
        eprintln!("[error] {}: {}", $ctx, format_args!($($arg)*))
    };
    ($($arg: tt)*) => {
        eprintln!("[error] {}", format_args!($($arg)*))
    };
}

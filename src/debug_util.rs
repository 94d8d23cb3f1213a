// Trace output for the lift passes, active when PEGLIFT_DEBUG=1. The first
// argument tags the pass emitting the line.
#[macro_export]
macro_rules! debug_log {
    ($tag:expr, $($arg:tt)*) => {
        if std::env::var("PEGLIFT_DEBUG").map(|v| v == "1").unwrap_or(false) {
            eprint!("[{}] ", $tag);
            eprintln!($($arg)*);
        }
    };
}

/// Panics in debug builds, logs an error via `tracing::error!` in release
/// builds. For invariants that must not take the process down in production.
#[macro_export]
macro_rules! soft_assert {
    ($cond:expr $(,)?) => {
        if !$cond {
            if cfg!(debug_assertions) {
                panic!("assertion failed: {}", stringify!($cond));
            } else {
                tracing::error!("assertion failed: {}", stringify!($cond));
            }
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            if cfg!(debug_assertions) {
                panic!($($arg)+);
            } else {
                tracing::error!($($arg)+);
            }
        }
    };
}

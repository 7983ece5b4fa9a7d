mod assert;
mod fmt;
mod style;

pub use fmt::{bytes_str, duration_str, rate_str};
pub use style::{BLUE, GREEN, MAGENTA, RED, RESET, YELLOW, paint};

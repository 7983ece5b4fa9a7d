//! ANSI colour codes for the session log lines.

pub const BLUE: &str = "\x1b[1;34m";
pub const GREEN: &str = "\x1b[1;32m";
pub const YELLOW: &str = "\x1b[1;33m";
pub const RED: &str = "\x1b[1;31m";
pub const MAGENTA: &str = "\x1b[1;35m";
pub const RESET: &str = "\x1b[0m";

/// Wraps `text` in the given colour code.
pub fn paint(colour: &str, text: &str) -> String {
    format!("{colour}{text}{RESET}")
}

//! Terminal raw mode and the interactive escape sequence.
//!
//! Raw mode is flipped when the first bytes of the remote shell arrive and
//! must be undone on every exit path: session teardown, panic, SIGTERM.

use std::{
    panic,
    sync::atomic::{AtomicBool, Ordering},
};

use signal_hook::{consts::SIGTERM, low_level};
use tracing::debug;

static RAW: AtomicBool = AtomicBool::new(false);

pub fn set_raw() {
    if !RAW.swap(true, Ordering::Relaxed) {
        debug!("switching terminal to raw mode");
        let _ = crossterm::terminal::enable_raw_mode();
    }
}

/// Idempotent; safe to call from any exit path.
pub fn reset() {
    if RAW.swap(false, Ordering::Relaxed) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

/// Installs the panic hook and SIGTERM handler that restore the terminal.
pub fn install_cleanup() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        reset();
        original_hook(panic_info);
    }));

    unsafe {
        let _ = low_level::register(SIGTERM, || {
            reset();
            std::process::exit(1);
        });
    }
}

/// Recognises `<newline> ~ .` typed at the start of a line, the session
/// terminator of the interactive client. Only the first byte of each stdin
/// chunk is offered.
pub struct EscapeWatcher {
    at_line_start: bool,
    saw_tilde: bool,
}

impl Default for EscapeWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EscapeWatcher {
    pub fn new() -> Self {
        Self { at_line_start: true, saw_tilde: false }
    }

    /// Returns true when the session should terminate.
    pub fn feed(&mut self, byte: u8) -> bool {
        if self.saw_tilde && byte == b'.' {
            return true;
        }
        self.saw_tilde = self.at_line_start && byte == b'~';
        self.at_line_start = byte == b'\n' || byte == b'\r';
        false
    }
}

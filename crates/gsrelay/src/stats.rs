//! Human-readable per-session summaries for the log.

use gsrelay_transport::GsStats;
use gsrelay_utils::{BLUE, GREEN, MAGENTA, RED, YELLOW, bytes_str, duration_str, paint, rate_str};

/// Close summary with byte counts and average throughput per direction.
/// `None` when the session never reached the connected state.
pub fn summary(id: u32, stats: &GsStats) -> Option<String> {
    let connected_at = stats.connected_at?;
    let elapsed = connected_at.elapsed();
    let millis = (elapsed.as_millis() as u64).max(1);

    Some(format!(
        "[ID={id}] disconnected after {}\n    Up: {:>12} [{}], Down: {:>12} [{}]",
        duration_str(elapsed),
        paint(MAGENTA, &bytes_str(stats.bytes_written)),
        rate_str(stats.bytes_written, millis),
        paint(MAGENTA, &bytes_str(stats.bytes_read)),
        rate_str(stats.bytes_read, millis),
    ))
}

/// Destination line for forward/SOCKS sessions, port colour-coded by
/// class: https green, http yellow, anything else red.
pub fn hostname_line(id: u32, prefix: &str, hostname: &str, port: u16) -> String {
    let port_colour = match port {
        443 => GREEN,
        80 => YELLOW,
        _ => RED,
    };
    format!(
        "[ID={id}] {prefix}{}:{}",
        paint(BLUE, hostname),
        paint(port_colour, &port.to_string())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_needs_a_connection() {
        assert!(summary(1, &GsStats::default()).is_none());

        let stats = GsStats {
            bytes_read: 1_000,
            bytes_written: 2_000,
            connected_at: Some(std::time::Instant::now()),
        };
        let line = summary(7, &stats).expect("connected sessions have stats");
        assert!(line.contains("[ID=7]"));
        assert!(line.contains("2.00 KB"));
        assert!(line.contains("1.00 KB"));
    }

    #[test]
    fn port_classes_pick_colours() {
        assert!(hostname_line(1, "", "example.com", 443).contains(GREEN));
        assert!(hostname_line(1, "", "example.com", 80).contains(YELLOW));
        assert!(hostname_line(1, "", "example.com", 22).contains(RED));
        assert!(hostname_line(1, "", "example.com", 22).contains(BLUE));
    }
}

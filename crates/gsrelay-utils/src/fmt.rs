use std::time::Duration;

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Human-readable byte count, decimal units.
pub fn bytes_str(n: u64) -> String {
    if n < 1000 {
        return format!("{n} {}", UNITS[0]);
    }
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if value >= 100.0 {
        format!("{value:.0} {}", UNITS[unit])
    } else if value >= 10.0 {
        format!("{value:.1} {}", UNITS[unit])
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// Average throughput over `millis` milliseconds. The divisor is clamped to
/// at least one millisecond.
pub fn rate_str(bytes: u64, millis: u64) -> String {
    let millis = millis.max(1);
    format!("{}/s", bytes_str(bytes.saturating_mul(1000) / millis))
}

/// Wall time as a short human string.
pub fn duration_str(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{:.3}s", d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_str_units() {
        assert_eq!(bytes_str(0), "0 B");
        assert_eq!(bytes_str(999), "999 B");
        assert_eq!(bytes_str(1000), "1.00 KB");
        assert_eq!(bytes_str(12_345), "12.3 KB");
        assert_eq!(bytes_str(123_456_789), "123 MB");
        assert_eq!(bytes_str(2_500_000_000), "2.50 GB");
    }

    #[test]
    fn rate_clamps_divisor() {
        // zero elapsed must not divide by zero
        assert_eq!(rate_str(1000, 0), "1.00 MB/s");
        assert_eq!(rate_str(1000, 1000), "1.00 KB/s");
    }

    #[test]
    fn duration_buckets() {
        assert_eq!(duration_str(Duration::from_millis(1500)), "1.500s");
        assert_eq!(duration_str(Duration::from_secs(65)), "1m 5s");
        assert_eq!(duration_str(Duration::from_secs(3725)), "1h 2m 5s");
    }
}

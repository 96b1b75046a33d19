//! Human-readable byte sizes

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Format a byte count with two decimals, scaling by 1024 up to PB
pub fn format_size(bytes: u64) -> String {
    format_size_f64(bytes as f64)
}

/// Same as [`format_size`] for fractional values such as transfer rates
pub fn format_size_f64(bytes: f64) -> String {
    let mut value = bytes;
    for unit in UNITS {
        if value < 1024.0 {
            return format!("{:.2} {}", value, unit);
        }
        value /= 1024.0;
    }
    // Everything past TB stays in PB, however large
    format!("{:.2} PB", value)
}

/// Format a rate in bytes per second
pub fn format_rate(bytes_per_sec: f64) -> String {
    format!("{}/s", format_size_f64(bytes_per_sec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_reference_values() {
        assert_eq!(format_size(0), "0.00 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(1073741824), "1.00 GB");
        assert_eq!(format_size(500 * 1024 * 1024), "500.00 MB");
    }

    #[test]
    fn values_beyond_a_petabyte_keep_the_pb_suffix() {
        let pb = 1024u64.pow(5);
        assert_eq!(format_size(pb), "1.00 PB");
        assert_eq!(format_size(pb * 2048), "2048.00 PB");
    }

    #[test]
    fn rate_appends_per_second() {
        assert_eq!(format_rate(2048.0), "2.00 KB/s");
    }
}

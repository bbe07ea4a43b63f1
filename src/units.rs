//! Byte sizes for humans: rendering and parsing capacities like `10Gi`

use crate::error::{Error, Result};

const KIB: u64 = 1024;

/// Binary unit suffixes, largest first
const UNITS: [(&str, u64); 5] = [
    ("PiB", KIB * KIB * KIB * KIB * KIB),
    ("TiB", KIB * KIB * KIB * KIB),
    ("GiB", KIB * KIB * KIB),
    ("MiB", KIB * KIB),
    ("KiB", KIB),
];

/// Render a byte count with two decimals in the largest fitting binary unit
pub fn format_bytes(bytes: u64) -> String {
    UNITS
        .iter()
        .find(|(_, size)| bytes >= *size)
        .map(|(suffix, size)| format!("{:.2}{}", bytes as f64 / *size as f64, suffix))
        .unwrap_or_else(|| format!("{}B", bytes))
}

/// Parse a capacity such as `512`, `100M`, `1.5Gi` or `2TiB` into bytes.
/// All units are binary.
pub fn parse_capacity(input: &str) -> Result<u64> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty capacity string".into()));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid number in {:?}", input)))?;

    let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KI" | "KIB" => KIB,
        "M" | "MB" | "MI" | "MIB" => KIB.pow(2),
        "G" | "GB" | "GI" | "GIB" => KIB.pow(3),
        "T" | "TB" | "TI" | "TIB" => KIB.pow(4),
        "P" | "PB" | "PI" | "PIB" => KIB.pow(5),
        other => return Err(Error::CapacityParse(format!("unknown unit {:?}", other))),
    };

    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(Error::CapacityParse(format!("{:?} is out of range", input)));
    }
    Ok(bytes.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0B");
        assert_eq!(format_bytes(1023), "1023B");
        assert_eq!(format_bytes(1024), "1.00KiB");
        assert_eq!(format_bytes(1536), "1.50KiB");
        assert_eq!(format_bytes(12 * KIB.pow(3)), "12.00GiB");
        assert_eq!(format_bytes(3 * KIB.pow(5)), "3.00PiB");
    }

    #[test]
    fn test_parse_capacity() {
        assert_eq!(parse_capacity("100").unwrap(), 100);
        assert_eq!(parse_capacity("100B").unwrap(), 100);
        assert_eq!(parse_capacity("1Ki").unwrap(), 1024);
        assert_eq!(parse_capacity(" 1M ").unwrap(), 1024 * 1024);
        assert_eq!(parse_capacity("10Gi").unwrap(), 10 * KIB.pow(3));
        assert_eq!(parse_capacity("1.5GiB").unwrap(), 3 * KIB.pow(3) / 2);
        assert_eq!(parse_capacity("2T").unwrap(), 2 * KIB.pow(4));

        assert!(parse_capacity("").is_err());
        assert!(parse_capacity("Gi").is_err());
        assert!(parse_capacity("100X").is_err());
        assert!(parse_capacity("1.2.3G").is_err());
    }
}

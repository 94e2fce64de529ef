//! Parsing and rendering of human-readable durations.
//!
//! Durations accept the unit suffixes `ms`, `s`, `m`, `h`, `D`, `W`, `M`,
//! `Y` (case-sensitive: `m` is minutes, `M` is months). The canonical
//! internal form is integer milliseconds. A bare number is milliseconds.

use anyhow::{bail, Context, Result};

const MS: i64 = 1;
const SECOND: i64 = 1000;
const MINUTE: i64 = 60 * SECOND;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;
const MONTH: i64 = 30 * DAY;
const YEAR: i64 = 365 * DAY;

/// Ordered longest-suffix-first so that `ms` wins over `s`.
const DURATION_UNITS: [(&str, i64); 8] = [
    ("ms", MS),
    ("s", SECOND),
    ("m", MINUTE),
    ("h", HOUR),
    ("D", DAY),
    ("W", WEEK),
    ("M", MONTH),
    ("Y", YEAR),
];

/// Parse a duration expression into non-negative milliseconds.
pub fn parse_duration_ms(input: &str) -> Result<i64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        bail!("empty duration");
    }

    let (number, factor) = match DURATION_UNITS
        .iter()
        .find(|(suffix, _)| trimmed.ends_with(suffix))
    {
        Some((suffix, factor)) => (trimmed[..trimmed.len() - suffix.len()].trim_end(), *factor),
        None => (trimmed, MS),
    };

    let value: i64 = number
        .parse()
        .with_context(|| format!("invalid duration '{}'", input))?;
    if value < 0 {
        bail!("negative duration '{}'", input);
    }

    value
        .checked_mul(factor)
        .with_context(|| format!("duration '{}' overflows", input))
}

/// Render milliseconds using the largest unit that divides it exactly.
pub fn format_duration_ms(ms: i64) -> String {
    if ms == 0 {
        return "0ms".to_string();
    }
    for (suffix, factor) in DURATION_UNITS.iter().rev() {
        if ms % factor == 0 {
            return format!("{}{}", ms / factor, suffix);
        }
    }
    format!("{}ms", ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_number_is_milliseconds() {
        assert_eq!(parse_duration_ms("1500").unwrap(), 1500);
    }

    #[test]
    fn all_duration_suffixes_parse() {
        assert_eq!(parse_duration_ms("10ms").unwrap(), 10);
        assert_eq!(parse_duration_ms("10s").unwrap(), 10_000);
        assert_eq!(parse_duration_ms("2m").unwrap(), 120_000);
        assert_eq!(parse_duration_ms("1h").unwrap(), 3_600_000);
        assert_eq!(parse_duration_ms("1D").unwrap(), 86_400_000);
        assert_eq!(parse_duration_ms("1W").unwrap(), 604_800_000);
        assert_eq!(parse_duration_ms("1M").unwrap(), 2_592_000_000);
        assert_eq!(parse_duration_ms("1Y").unwrap(), 31_536_000_000);
    }

    #[test]
    fn minutes_and_months_are_case_sensitive() {
        assert_eq!(parse_duration_ms("1m").unwrap(), 60_000);
        assert_eq!(parse_duration_ms("1M").unwrap(), 2_592_000_000);
    }

    #[test]
    fn whitespace_between_number_and_unit() {
        assert_eq!(parse_duration_ms(" 5 s ").unwrap(), 5000);
    }

    #[test]
    fn negative_duration_rejected() {
        assert!(parse_duration_ms("-5s").is_err());
    }

    #[test]
    fn garbage_duration_rejected() {
        assert!(parse_duration_ms("abc").is_err());
        assert!(parse_duration_ms("").is_err());
        assert!(parse_duration_ms("12q").is_err());
    }

    #[test]
    fn format_picks_largest_exact_unit() {
        assert_eq!(format_duration_ms(0), "0ms");
        assert_eq!(format_duration_ms(1500), "1500ms");
        assert_eq!(format_duration_ms(60_000), "1m");
        assert_eq!(format_duration_ms(7_200_000), "2h");
    }

    #[test]
    fn duration_roundtrip() {
        for input in ["250ms", "30s", "15m", "6h", "3D", "2W", "1M", "1Y"] {
            let ms = parse_duration_ms(input).unwrap();
            assert_eq!(format_duration_ms(ms), input);
        }
    }
}

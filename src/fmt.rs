//! Provides parsing and formatting helpers for durations.
//!
//! Cache settings are usually given as short duration expressions like `"3s"` or `"15m"`, and the
//! statistics report producer timings in microseconds. Both directions are handled here.
use std::fmt::Write;
use std::time::Duration;

use anyhow::Context;

/// The units known to [parse_duration] and [format_duration] along with their length in
/// milliseconds, ordered from largest to smallest.
const UNITS: [(&str, u64); 5] = [
    ("d", 24 * 60 * 60 * 1000),
    ("h", 60 * 60 * 1000),
    ("m", 60 * 1000),
    ("s", 1000),
    ("ms", 1),
];

/// Formats a duration given in microseconds into the given writer.
///
/// The unit (microseconds, milliseconds or seconds) is picked so that the output stays short
/// while keeping three significant digits where possible.
pub fn format_micros(micros: u64, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
    match micros {
        0..=999 => write!(f, "{} us", micros),
        1_000..=999_999 => write_scaled(f, micros as f64 / 1_000., "ms"),
        _ => write_scaled(f, micros as f64 / 1_000_000., "s"),
    }
}

fn write_scaled(f: &mut dyn std::fmt::Write, value: f64, unit: &str) -> std::fmt::Result {
    if value < 10. {
        write!(f, "{:.2} {}", value, unit)
    } else if value < 100. {
        write!(f, "{:.1} {}", value, unit)
    } else {
        write!(f, "{:.0} {}", value, unit)
    }
}

/// Formats a duration given in microseconds and returns it as String.
///
/// # Examples
///
/// ```
/// assert_eq!(evergreen::fmt::format_short_duration(100), "100 us");
/// assert_eq!(evergreen::fmt::format_short_duration(8_192), "8.19 ms");
/// assert_eq!(evergreen::fmt::format_short_duration(32_768), "32.8 ms");
/// assert_eq!(evergreen::fmt::format_short_duration(128_123), "128 ms");
/// assert_eq!(evergreen::fmt::format_short_duration(1_128_123), "1.13 s");
/// assert_eq!(evergreen::fmt::format_short_duration(101_000_000), "101 s");
/// ```
pub fn format_short_duration(micros: u64) -> String {
    let mut result = String::new();
    let _ = format_micros(micros, &mut result);
    result
}

/// Parses a duration from a given string.
///
/// The string consists of a non-negative integer followed by an optional unit:
/// * **ms**: milliseconds (also used if no unit is given)
/// * **s**: seconds
/// * **m**: minutes
/// * **h**: hours
/// * **d**: days
///
/// Units are case insensitive and may be separated from the number by whitespace.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(evergreen::fmt::parse_duration("250").unwrap(), Duration::from_millis(250));
/// assert_eq!(evergreen::fmt::parse_duration("100 ms").unwrap(), Duration::from_millis(100));
/// assert_eq!(evergreen::fmt::parse_duration("3s").unwrap(), Duration::from_secs(3));
/// assert_eq!(evergreen::fmt::parse_duration("15 M").unwrap(), Duration::from_secs(15 * 60));
/// assert_eq!(evergreen::fmt::parse_duration("1h").unwrap(), Duration::from_secs(60 * 60));
/// assert_eq!(evergreen::fmt::parse_duration("2d").unwrap(), Duration::from_secs(2 * 24 * 60 * 60));
///
/// assert!(evergreen::fmt::parse_duration("3 weeks").is_err());
/// assert!(evergreen::fmt::parse_duration("1.5s").is_err());
/// assert!(evergreen::fmt::parse_duration("-1m").is_err());
/// ```
pub fn parse_duration(str: impl AsRef<str>) -> anyhow::Result<Duration> {
    lazy_static::lazy_static! {
        static ref DURATION: regex::Regex =
            regex::Regex::new(r"^\s*(\d+)\s*([a-zA-Z]*)\s*$").unwrap();
    }

    let input = str.as_ref();
    let captures = DURATION.captures(input).with_context(|| {
        format!(
            "Cannot parse '{}' as duration. Expected a number optionally followed by 'ms', 's', 'm', 'h' or 'd'.",
            input
        )
    })?;

    let number = captures[1]
        .parse::<u64>()
        .with_context(|| format!("The duration '{}' is out of range.", input))?;
    let unit = captures[2].to_lowercase();
    let millis_per_unit = if unit.is_empty() {
        1
    } else {
        UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, millis)| *millis)
            .with_context(|| format!("Unknown duration unit '{}' in '{}'.", unit, input))?
    };

    number
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .with_context(|| format!("The duration '{}' is out of range.", input))
}

/// Formats a duration into a string like "1d 2h 3m 4s 5ms".
///
/// Units which are zero are skipped, a zero duration is rendered as "0ms".
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(evergreen::fmt::format_duration(Duration::ZERO), "0ms");
/// assert_eq!(evergreen::fmt::format_duration(Duration::from_millis(1013)), "1s 13ms");
/// assert_eq!(evergreen::fmt::format_duration(Duration::from_secs(3)), "3s");
/// assert_eq!(evergreen::fmt::format_duration(Duration::from_secs(60 * 61)), "1h 1m");
/// assert_eq!(evergreen::fmt::format_duration(Duration::from_secs(24 * 60 * 60 + 59)), "1d 59s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let mut remainder = duration.as_millis();
    let mut result = String::new();

    for (name, millis) in UNITS {
        let millis = millis as u128;
        let amount = remainder / millis;
        if amount > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}{}", amount, name);
            remainder %= millis;
        }
    }

    if result.is_empty() {
        result.push_str("0ms");
    }

    result
}

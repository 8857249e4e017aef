use std::ffi::OsString;
use std::str::FromStr;
use tokio::time::Duration;

/// Parses a duration string such as "30s", "10m", "5h", "3d", "500ms" or a
/// compound form like "1m30s".
///
/// Supported units:
/// - `ms` for milliseconds
/// - `s` for seconds
/// - `m` for minutes
/// - `h` for hours
/// - `d` for days
pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration string cannot be empty".to_string());
    }

    let mut total_ms: u64 = 0;
    let mut rest = s;

    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let (value_str, tail) = rest.split_at(digits_end);
        let unit_end = tail
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_end);

        let value = match u64::from_str(value_str) {
            Ok(v) => v,
            Err(_) => {
                return Err(format!(
                    "Invalid numeric value in duration: '{}'",
                    value_str
                ))
            }
        };

        // A component like "5.5h" leaves a non-unit character right after the digits.
        if unit.is_empty() && !next.is_empty() {
            return Err(format!("Invalid numeric value in duration: '{}'", rest));
        }

        let unit_ms: u64 = match unit {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60 * 1_000,
            "h" => 60 * 60 * 1_000,
            "d" => 24 * 60 * 60 * 1_000,
            _ => {
                return Err(format!(
                    "Unknown duration unit: '{}'. Use 'ms', 's', 'm', 'h', or 'd'.",
                    unit
                ))
            }
        };

        total_ms = value
            .checked_mul(unit_ms)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| format!("Duration '{}' is too large", s))?;

        rest = next;
    }

    Ok(Duration::from_millis(total_ms))
}

/// Rewrites single-dash long flags (`-resolve host:443:addr`) into the
/// double-dash form clap expects. Everything else passes through untouched.
pub fn normalize_long_flags<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    const LONG_FLAGS: &[&str] = &["resolve", "output", "metrics-port"];

    args.into_iter()
        .map(|arg| {
            let Some(text) = arg.to_str() else {
                return arg;
            };
            let Some(stripped) = text.strip_prefix('-') else {
                return arg;
            };
            if stripped.starts_with('-') {
                return arg;
            }
            let name = stripped.split('=').next().unwrap_or_default();
            if LONG_FLAGS.contains(&name) {
                OsString::from(format!("-{}", text))
            } else {
                arg
            }
        })
        .collect()
}

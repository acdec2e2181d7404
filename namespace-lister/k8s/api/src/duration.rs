use std::{fmt, str::FromStr, time::Duration};

/// A non-negative duration in Go's `time.ParseDuration` syntax, e.g. `10m` or `1h30m15.5s`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct GoDuration(Duration);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty duration")]
    Empty,

    #[error("negative durations are not supported")]
    Negative,

    #[error("missing unit in duration {0:?}; expected one of ns, us, ms, s, m, h")]
    MissingUnit(String),

    #[error("unknown unit {0:?}; expected one of ns, us, ms, s, m, h")]
    UnknownUnit(String),

    #[error("invalid number in duration {0:?}")]
    InvalidNumber(String),

    #[error("duration overflows")]
    Overflow,
}

impl GoDuration {
    pub const ZERO: Self = Self(Duration::ZERO);
}

impl From<Duration> for GoDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl From<GoDuration> for Duration {
    fn from(GoDuration(d): GoDuration) -> Self {
        d
    }
}

impl FromStr for GoDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut rest = match s.as_bytes().first() {
            None => return Err(ParseError::Empty),
            Some(b'-') if s != "-0" => return Err(ParseError::Negative),
            Some(b'-' | b'+') => &s[1..],
            Some(_) => s,
        };

        // A bare zero is the only value that may omit its unit.
        if rest == "0" {
            return Ok(Self::ZERO);
        }
        if rest.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut total = Duration::ZERO;
        while !rest.is_empty() {
            let num_end = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .ok_or_else(|| ParseError::MissingUnit(s.to_string()))?;
            let (num, tail) = rest.split_at(num_end);
            let unit_end = tail
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(tail.len());
            let (unit, tail) = tail.split_at(unit_end);
            let nanos = scaled_nanos(num, unit_nanos(unit)?)
                .ok_or_else(|| ParseError::InvalidNumber(s.to_string()))?;
            total = u64::try_from(nanos)
                .ok()
                .and_then(|n| total.checked_add(Duration::from_nanos(n)))
                .ok_or(ParseError::Overflow)?;
            rest = tail;
        }

        Ok(Self(total))
    }
}

fn unit_nanos(unit: &str) -> Result<u128, ParseError> {
    const SEC: u128 = 1_000_000_000;
    match unit {
        "ns" => Ok(1),
        // Go accepts both the micro sign and the Greek letter mu.
        "us" | "\u{00b5}s" | "\u{03bc}s" => Ok(1_000),
        "ms" => Ok(1_000_000),
        "s" => Ok(SEC),
        "m" => Ok(60 * SEC),
        "h" => Ok(60 * 60 * SEC),
        unit => Err(ParseError::UnknownUnit(unit.to_string())),
    }
}

/// Multiplies a decimal number by a unit without going through floating point. Fractions finer
/// than a nanosecond are truncated.
fn scaled_nanos(num: &str, unit: u128) -> Option<u128> {
    let (int, frac) = num.split_once('.').unwrap_or((num, ""));
    if int.is_empty() && frac.is_empty() {
        return None;
    }
    if !int.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let whole = if int.is_empty() {
        0
    } else {
        int.parse::<u128>().ok()?.checked_mul(unit)?
    };
    let (mut part, mut scale) = (0u128, 1u128);
    for b in frac.bytes().take(18) {
        part = part * 10 + u128::from(b - b'0');
        scale *= 10;
    }
    whole.checked_add(part * unit / scale)
}

impl fmt::Display for GoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_zero() {
            return f.write_str("0s");
        }

        let secs = self.0.as_secs();
        let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
        let nanos = self.0.subsec_nanos();
        if h > 0 {
            write!(f, "{h}h")?;
        }
        if h > 0 || m > 0 {
            write!(f, "{m}m")?;
        }
        if nanos == 0 {
            write!(f, "{s}s")
        } else {
            let frac = format!("{nanos:09}");
            write!(f, "{s}.{}s", frac.trim_end_matches('0'))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses() {
        for (input, expected) in [
            ("0", Duration::ZERO),
            ("+0", Duration::ZERO),
            ("-0", Duration::ZERO),
            ("0s", Duration::ZERO),
            ("10m", Duration::from_secs(600)),
            ("1h30m", Duration::from_secs(90 * 60)),
            ("1.5s", Duration::from_millis(1500)),
            (".5s", Duration::from_millis(500)),
            ("2h45m10s", Duration::from_secs(2 * 3600 + 45 * 60 + 10)),
            ("300ms", Duration::from_millis(300)),
            ("10us", Duration::from_micros(10)),
            ("10\u{00b5}s", Duration::from_micros(10)),
            ("7ns", Duration::from_nanos(7)),
        ] {
            assert_eq!(
                input.parse::<GoDuration>().map(Duration::from),
                Ok(expected),
                "{input}"
            );
        }
    }

    #[test]
    fn rejects() {
        assert_eq!("".parse::<GoDuration>(), Err(ParseError::Empty));
        assert_eq!("-5m".parse::<GoDuration>(), Err(ParseError::Negative));
        assert_eq!(
            "10".parse::<GoDuration>(),
            Err(ParseError::MissingUnit("10".to_string()))
        );
        assert_eq!(
            "10d".parse::<GoDuration>(),
            Err(ParseError::UnknownUnit("d".to_string()))
        );
        assert_eq!(
            "m".parse::<GoDuration>(),
            Err(ParseError::InvalidNumber("m".to_string()))
        );
        assert_eq!(
            "1..5s".parse::<GoDuration>(),
            Err(ParseError::InvalidNumber("1..5s".to_string()))
        );
    }

    #[test]
    fn displays() {
        for (d, expected) in [
            (Duration::ZERO, "0s"),
            (Duration::from_secs(600), "10m0s"),
            (Duration::from_secs(3725), "1h2m5s"),
            (Duration::from_millis(1500), "1.5s"),
        ] {
            assert_eq!(GoDuration::from(d).to_string(), expected);
        }
    }
}

//! Go-style duration strings (`300ms`, `1.5h`, `2h45m`).

use std::time::Duration;

use crate::TetherError;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Parse a duration string made of decimal numbers with unit suffixes
/// (`ns`, `us`/`µs`, `ms`, `s`, `m`, `h`). A bare `0` is accepted.
/// Negative values are rejected.
pub fn parse_duration(input: &str) -> Result<Duration, TetherError> {
    let err = |why: &str| TetherError::Configuration(format!("invalid duration {:?}: {}", input, why));
    let mut s = input.trim();
    if let Some(rest) = s.strip_prefix('+') {
        s = rest;
    }
    if s.starts_with('-') {
        return Err(err("negative durations are not allowed"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(err("empty"));
    }

    let mut total: u128 = 0;
    while !s.is_empty() {
        let int_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (int_part, rest) = s.split_at(int_end);
        let (frac_part, rest) = match rest.strip_prefix('.') {
            Some(r) => r.split_at(r.find(|c: char| !c.is_ascii_digit()).unwrap_or(r.len())),
            None => ("", rest),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(err("expected a number"));
        }
        let unit_end = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let (unit, rest) = rest.split_at(unit_end);
        let scale: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => NANOS_PER_SEC,
            "m" => 60 * NANOS_PER_SEC,
            "h" => 3_600 * NANOS_PER_SEC,
            "" => return Err(err("missing unit")),
            other => return Err(err(&format!("unknown unit {:?}", other))),
        };

        let whole: u128 = if int_part.is_empty() { 0 } else { int_part.parse().map_err(|_| err("number out of range"))? };
        let mut nanos = whole.checked_mul(scale).ok_or_else(|| err("overflow"))?;
        let mut frac_scale = scale;
        for digit in frac_part.bytes() {
            frac_scale /= 10;
            if frac_scale == 0 {
                break;
            }
            nanos = nanos.checked_add(u128::from(digit - b'0') * frac_scale).ok_or_else(|| err("overflow"))?;
        }
        total = total.checked_add(nanos).ok_or_else(|| err("overflow"))?;
        s = rest;
    }

    let secs = u64::try_from(total / NANOS_PER_SEC).map_err(|_| err("overflow"))?;
    // remainder is always below one second
    let sub = (total % NANOS_PER_SEC) as u32;
    Ok(Duration::new(secs, sub))
}

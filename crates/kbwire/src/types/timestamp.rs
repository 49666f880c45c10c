//! Date, time and timestamp text forms.
//!
//! The server renders timestamps as
//! `YYYY-MM-DD[ HH:MM:SS[.ffffff]][±HH[:MM[:SS]]][ BC]`. The parser here is
//! fixed-position: it reads fields at known offsets from the first `-` rather
//! than tokenizing, and rejects anything left over.
//!
//! Values are kept as integers relative to the Unix epoch: days for dates,
//! microseconds for times and timestamps. Fractions finer than a microsecond
//! are truncated.
//!
//! Zone offsets are applied while parsing and kept on `ParsedTimestamp`, so
//! there is no shared cache of fixed-offset zones.

#![allow(clippy::result_large_err)]
#![allow(clippy::cast_possible_truncation)]

use kbwire_core::Error;
use kbwire_core::error::TypeError;

pub const MICROS_PER_SEC: i64 = 1_000_000;
pub const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SEC;

/// A timestamp as written on the wire, before zone adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedTimestamp {
    /// Wall-clock microseconds since 1970-01-01 00:00:00.
    pub local_micros: i64,
    /// Zone offset east of UTC in seconds, when the text carried one.
    pub offset_secs: Option<i32>,
    /// Whether the text had a time-of-day part.
    pub has_time: bool,
}

impl ParsedTimestamp {
    /// The instant in UTC. Text without an offset is read as UTC.
    pub fn utc_micros(&self) -> i64 {
        self.local_micros
            .saturating_sub(i64::from(self.offset_secs.unwrap_or(0)) * MICROS_PER_SEC)
    }
}

// ==================== Parsing ====================

struct Scanner<'a> {
    text: &'a str,
}

impl<'a> Scanner<'a> {
    fn byte(&self, pos: usize) -> Option<u8> {
        self.text.as_bytes().get(pos).copied()
    }

    fn len(&self) -> usize {
        self.text.len()
    }

    fn atoi(&self, from: usize, to: usize) -> Result<i64, Error> {
        let digits = self
            .text
            .as_bytes()
            .get(from..to)
            .filter(|d| !d.is_empty() && d.iter().all(u8::is_ascii_digit))
            .ok_or_else(|| invalid(self.text))?;
        Ok(digits
            .iter()
            .fold(0_i64, |acc, d| acc.saturating_mul(10).saturating_add(i64::from(d - b'0'))))
    }

    fn expect(&self, want: u8, pos: usize) -> Result<(), Error> {
        if self.byte(pos) == Some(want) {
            Ok(())
        } else {
            Err(timestamp_error(format!(
                "expected '{}' at position {}; got {:?}",
                want as char, pos, self.text
            )))
        }
    }

    /// Parse `.ffffff` starting at `pos` (which holds the dot).
    /// Returns microseconds and the index after the fraction.
    fn fraction(&self, pos: usize) -> Result<(i64, usize), Error> {
        let start = pos + 1;
        let tail = self.text.get(start..).ok_or_else(|| invalid(self.text))?;
        let digits = tail.find(['-', '+', ' ']).unwrap_or(tail.len());
        // Only the first nine digits can carry information at nanosecond scale.
        let kept = digits.min(9);
        let value = self.atoi(start, start + digits).and(self.atoi(start, start + kept))?;
        let micros = if kept >= 6 {
            value / 10_i64.pow((kept - 6) as u32)
        } else {
            value * 10_i64.pow((6 - kept) as u32)
        };
        Ok((micros, start + digits))
    }

    /// Parse `±HH[:MM[:SS]]` at `pos` if present.
    fn zone(&self, pos: usize) -> Result<(Option<i32>, usize), Error> {
        let sign = match self.byte(pos) {
            Some(b'-') => -1,
            Some(b'+') => 1,
            _ => return Ok((None, pos)),
        };
        let hours = self.atoi(pos + 1, pos + 3)?;
        let mut idx = pos + 3;
        let mut minutes = 0;
        let mut seconds = 0;
        if self.byte(idx) == Some(b':') {
            minutes = self.atoi(idx + 1, idx + 3)?;
            idx += 3;
        }
        if self.byte(idx) == Some(b':') {
            seconds = self.atoi(idx + 1, idx + 3)?;
            idx += 3;
        }
        let offset = sign * (hours * 3600 + minutes * 60 + seconds);
        Ok((Some(offset as i32), idx))
    }
}

/// Parse a timestamp or timestamptz text value.
pub fn parse_timestamp(text: &str) -> Result<ParsedTimestamp, Error> {
    let sc = Scanner { text };
    let mon_sep = text.find('-').ok_or_else(|| invalid(text))?;
    let year = sc.atoi(0, mon_sep)?;
    let day_sep = mon_sep + 3;
    let month = sc.atoi(mon_sep + 1, day_sep)?;
    sc.expect(b'-', day_sep)?;
    let time_sep = day_sep + 3;
    let day = sc.atoi(day_sep + 1, time_sep)?;

    let is_bc = text.ends_with(" BC");
    let mut min_len = mon_sep + "01-01".len() + 1;
    if is_bc {
        min_len += 3;
    }

    let (mut hour, mut minute, mut second) = (0, 0, 0);
    let has_time = sc.len() > min_len;
    if has_time {
        sc.expect(b' ', time_sep)?;
        let min_sep = time_sep + 3;
        sc.expect(b':', min_sep)?;
        hour = sc.atoi(time_sep + 1, min_sep)?;
        let sec_sep = min_sep + 3;
        sc.expect(b':', sec_sep)?;
        minute = sc.atoi(min_sep + 1, sec_sep)?;
        second = sc.atoi(sec_sep + 1, sec_sep + 3)?;
    }

    let mut idx = mon_sep + "01-01 00:00:00".len() + 1;
    let mut micros = 0;
    if sc.byte(idx) == Some(b'.') {
        let (frac, next) = sc.fraction(idx)?;
        micros = frac;
        idx = next;
    }
    let (offset_secs, next) = sc.zone(idx)?;
    idx = next;

    let iso_year = if is_bc {
        idx += 3;
        1 - year
    } else {
        year
    };
    if sc.len() > idx {
        return Err(timestamp_error(format!(
            "expected end of input, got {}",
            String::from_utf8_lossy(&text.as_bytes()[idx..])
        )));
    }

    let days = days_from_civil(iso_year, month, day, text)?;
    let local_micros = i64::from(days)
        .checked_mul(MICROS_PER_DAY)
        .zip(clock_micros(hour, minute, second, micros))
        .and_then(|(date, clock)| date.checked_add(clock))
        .ok_or_else(|| invalid(text))?;
    Ok(ParsedTimestamp {
        local_micros,
        offset_secs,
        has_time,
    })
}

/// Parse a time or timetz text value. Returns microseconds since midnight
/// and the zone offset if one was present.
pub fn parse_time(text: &str) -> Result<(i64, Option<i32>), Error> {
    let sc = Scanner { text };
    let min_sep = text.find(':').ok_or_else(|| invalid(text))?;
    let hour = sc.atoi(0, min_sep)?;
    let sec_sep = min_sep + 3;
    sc.expect(b':', sec_sep)?;
    let minute = sc.atoi(min_sep + 1, sec_sep)?;
    let sec_end = sec_sep + 3;
    let second = sc.atoi(sec_sep + 1, sec_end)?;

    let mut idx = sec_end;
    let mut micros = 0;
    if sc.byte(idx) == Some(b'.') {
        let (frac, next) = sc.fraction(idx)?;
        micros = frac;
        idx = next;
    }
    let (offset, next) = sc.zone(idx)?;
    idx = next;
    if sc.len() > idx {
        return Err(timestamp_error(format!(
            "expected end of input, got {}",
            String::from_utf8_lossy(&text.as_bytes()[idx..])
        )));
    }
    let clock = clock_micros(hour, minute, second, micros).ok_or_else(|| invalid(text))?;
    Ok((clock, offset))
}

/// Microseconds for a clock reading; `None` on overflow.
fn clock_micros(hour: i64, minute: i64, second: i64, micros: i64) -> Option<i64> {
    hour.checked_mul(60)?
        .checked_add(minute)?
        .checked_mul(60)?
        .checked_add(second)?
        .checked_mul(MICROS_PER_SEC)?
        .checked_add(micros)
}

/// Parse a `YYYY-MM-DD[ BC]` date. Returns days since 1970-01-01.
pub fn parse_date(text: &str) -> Result<i32, Error> {
    let sc = Scanner { text };
    let mon_sep = text.find('-').ok_or_else(|| invalid(text))?;
    let year = sc.atoi(0, mon_sep)?;
    let day_sep = mon_sep + 3;
    let month = sc.atoi(mon_sep + 1, day_sep)?;
    sc.expect(b'-', day_sep)?;
    let day = sc.atoi(day_sep + 1, day_sep + 3)?;
    let year = if text.ends_with(" BC") { 1 - year } else { year };
    days_from_civil(year, month, day, text)
}

// ==================== Formatting ====================

/// Format a timestamp. `offset_secs` of `None` omits the zone suffix.
///
/// Years at or before zero are written with a ` BC` suffix, so year 0 is
/// `0001 BC`.
pub fn format_timestamp(utc_micros: i64, offset_secs: Option<i32>) -> String {
    let local = utc_micros + i64::from(offset_secs.unwrap_or(0)) * MICROS_PER_SEC;
    let days = local.div_euclid(MICROS_PER_DAY);
    let tod = local.rem_euclid(MICROS_PER_DAY);

    let (year, month, day) = civil_from_days(days);
    let (year, bc) = if year <= 0 { (1 - year, true) } else { (year, false) };

    let mut out = format!("{year:04}-{month:02}-{day:02} ");
    push_time_of_day(&mut out, tod);
    if let Some(offset) = offset_secs {
        push_offset(&mut out, offset);
    }
    if bc {
        out.push_str(" BC");
    }
    out
}

/// Format days since the epoch as `YYYY-MM-DD[ BC]`.
pub fn format_date(days: i32) -> String {
    let (year, month, day) = civil_from_days(i64::from(days));
    if year <= 0 {
        format!("{:04}-{month:02}-{day:02} BC", 1 - year)
    } else {
        format!("{year:04}-{month:02}-{day:02}")
    }
}

/// Format microseconds since midnight as `HH:MM:SS[.ffffff]`.
pub fn format_time(micros: i64) -> String {
    let mut out = String::with_capacity(15);
    push_time_of_day(&mut out, micros.rem_euclid(MICROS_PER_DAY));
    out
}

fn push_time_of_day(out: &mut String, micros: i64) {
    let secs = micros / MICROS_PER_SEC;
    let frac = micros % MICROS_PER_SEC;
    out.push_str(&format!(
        "{:02}:{:02}:{:02}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    ));
    if frac != 0 {
        let digits = format!("{frac:06}");
        out.push('.');
        out.push_str(digits.trim_end_matches('0'));
    }
}

fn push_offset(out: &mut String, offset: i32) {
    let sign = if offset < 0 { '-' } else { '+' };
    let abs = offset.unsigned_abs();
    out.push_str(&format!("{sign}{:02}:{:02}", abs / 3600, (abs % 3600) / 60));
    if abs % 60 != 0 {
        out.push_str(&format!(":{:02}", abs % 60));
    }
}

// ==================== Calendar ====================

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(year: i64, month: i64, day: i64, text: &str) -> Result<i32, Error> {
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(invalid(text));
    }
    // https://howardhinnant.github.io/date_algorithms.html
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era.checked_mul(146_097)
        .and_then(|d| d.checked_add(doe - 719_468))
        .and_then(|d| i32::try_from(d).ok())
        .ok_or_else(|| invalid(text))
}

/// Inverse of `days_from_civil`: (year, month, day).
pub fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

fn invalid(text: &str) -> Error {
    timestamp_error(format!("invalid timestamp {text:?}"))
}

fn timestamp_error(actual: String) -> Error {
    Error::Type(TypeError {
        expected: "timestamp",
        actual,
        column: None,
        rust_type: None,
    })
}

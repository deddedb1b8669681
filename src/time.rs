use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike, Utc};

use crate::error::{Result, SerieslyError};

/// Nanosecond multipliers indexed by the number of sub-second digits present.
const POW_TABLE: [u32; 10] = [
    1_000_000_000,
    100_000_000,
    10_000_000,
    1_000_000,
    100_000,
    10_000,
    1_000,
    100,
    10,
    1,
];

fn bad(input: &str) -> SerieslyError {
    SerieslyError::BadTimestamp(input.to_string())
}

/// Parses the canonical seriesly time format.
///
/// This is a hand crafted parser since it's a really common path and it
/// beats a general format-driven parse by a wide margin.
pub fn parse_canonical_time(input: &str) -> Result<DateTime<Utc>> {
    let b = input.as_bytes();
    if b.len() < 20 || !input.is_ascii() || b[b.len() - 1] != b'Z' {
        return Err(bad(input));
    }

    if !(b[4] == b'-'
        && b[7] == b'-'
        && b[10] == b'T'
        && b[13] == b':'
        && b[16] == b':'
        && (b[19] == b'.' || b[19] == b'Z'))
    {
        return Err(bad(input));
    }

    // 2012-08-28T21:24:35.37465188Z
    //     4  7  10 13 16 19

    let year: i32 = input[0..4].parse().map_err(|_| bad(input))?;
    let month: u32 = input[5..7].parse().map_err(|_| bad(input))?;
    let day: u32 = input[8..10].parse().map_err(|_| bad(input))?;
    let hour: u32 = input[11..13].parse().map_err(|_| bad(input))?;
    let minute: u32 = input[14..16].parse().map_err(|_| bad(input))?;
    let second: u32 = input[17..19].parse().map_err(|_| bad(input))?;

    let nsec_str = if b[19] == b'Z' {
        ""
    } else {
        &input[20..input.len() - 1]
    };
    if nsec_str.len() >= POW_TABLE.len() {
        return Err(bad(input));
    }
    let nsec: u32 = if nsec_str.is_empty() {
        0
    } else {
        nsec_str.parse().map_err(|_| bad(input))?
    };
    let nsec = nsec * POW_TABLE[nsec_str.len()];

    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_nano_opt(hour, minute, second, nsec))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| bad(input))
}

/// Parses any timestamp format seriesly accepts.
///
/// Integers are disambiguated by magnitude: nanoseconds, then milliseconds,
/// then seconds. Integers at or below 10000 are not treated as epochs (they
/// would be hopelessly ambiguous) and fall through to the textual formats,
/// where a bare `2012` still parses as a year.
pub fn parse_time(input: &str) -> Result<DateTime<Utc>> {
    if let Ok(n) = input.parse::<i64>() {
        if n > i64::from(i32::MAX) * 1000 {
            return Ok(DateTime::from_timestamp_nanos(n));
        }
        if n > i64::from(i32::MAX) {
            return DateTime::from_timestamp_millis(n).ok_or_else(|| bad(input));
        }
        if n > 10_000 {
            return DateTime::from_timestamp(n, 0).ok_or_else(|| bad(input));
        }
    }

    if let Ok(t) = parse_canonical_time(input) {
        return Ok(t);
    }

    if let Ok(t) = DateTime::parse_from_rfc3339(input) {
        return Ok(t.with_timezone(&Utc));
    }

    // RFC1123 with a numeric zone, then ruby-style dates.
    for fmt in ["%a, %d %b %Y %H:%M:%S %z", "%a %b %e %H:%M:%S %z %Y"] {
        if let Ok(t) = DateTime::parse_from_str(input, fmt) {
            return Ok(t.with_timezone(&Utc));
        }
    }

    // RFC1123 / unix date with a named UTC zone, and the ANSI C form.
    for fmt in [
        "%a, %d %b %Y %H:%M:%S UTC",
        "%a, %d %b %Y %H:%M:%S GMT",
        "%a %b %e %H:%M:%S UTC %Y",
        "%a %b %e %H:%M:%S GMT %Y",
        "%a %b %e %H:%M:%S %Y",
    ] {
        if let Ok(t) = NaiveDateTime::parse_from_str(input, fmt) {
            return Ok(t.and_utc());
        }
    }

    parse_partial_iso(input).ok_or_else(|| bad(input))
}

/// Partial ISO dates parse with the missing fields zero filled.
fn parse_partial_iso(input: &str) -> Option<DateTime<Utc>> {
    let padded = match input.len() {
        16 => input.to_string(),                  // 2006-01-02T15:04
        13 => format!("{input}:00"),              // 2006-01-02T15
        10 => format!("{input}T00:00"),           // 2006-01-02
        7 => format!("{input}-01T00:00"),         // 2006-01
        4 => format!("{input}-01-01T00:00"),      // 2006
        _ => return None,
    };
    NaiveDateTime::parse_from_str(&padded, "%Y-%m-%dT%H:%M")
        .ok()
        .map(|dt| dt.and_utc())
}

/// Formats a time in the canonical key form: RFC3339, UTC, nanosecond
/// precision with trailing fraction zeros trimmed.
pub fn format_canonical(t: DateTime<Utc>) -> String {
    let base = t.format("%Y-%m-%dT%H:%M:%S");
    let nanos = t.nanosecond() % 1_000_000_000;
    if nanos == 0 {
        return format!("{base}Z");
    }
    let frac = format!("{nanos:09}");
    format!("{base}.{}Z", frac.trim_end_matches('0'))
}

/// The current instant as a canonical document key.
pub fn now_key() -> String {
    format_canonical(Utc::now())
}

/// The integer view of a document key: its UnixNano, or -1 when the key is
/// not a canonical timestamp. Non-canonical keys are skipped by time
/// bucketed queries but still round-trip on point gets.
pub fn parse_key(key: &str) -> i64 {
    match parse_canonical_time(key) {
        Ok(t) => t.timestamp_nanos_opt().unwrap_or(-1),
        Err(_) => -1,
    }
}

/// Formats a UnixNano value as a canonical key.
pub fn format_key(nanos: i64) -> String {
    format_canonical(DateTime::from_timestamp_nanos(nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = "2012-08-28T21:24:35.37465188Z";
    const MILLI_ACCURACY: &str = "2012-08-28T21:24:35.374Z";
    const SECOND_ACCURACY: &str = "2012-08-28T21:24:35Z";

    #[test]
    fn parses_the_supported_formats() {
        let tests = [
            ("1346189075374651880", EXAMPLE),
            ("1346189075374", MILLI_ACCURACY),
            ("1346189075", SECOND_ACCURACY),
            (EXAMPLE, EXAMPLE),
            (SECOND_ACCURACY, SECOND_ACCURACY),
            ("Tue, 28 Aug 2012 21:24:35 +0000", SECOND_ACCURACY),
            ("Tue, 28 Aug 2012 21:24:35 UTC", SECOND_ACCURACY),
            ("Tue Aug 28 21:24:35 UTC 2012", SECOND_ACCURACY),
            ("Tue Aug 28 21:24:35 2012", SECOND_ACCURACY),
            ("Tue Aug 28 21:24:35 +0000 2012", SECOND_ACCURACY),
            ("2012-08-28T21:24", "2012-08-28T21:24:00Z"),
            ("2012-08-28T21", "2012-08-28T21:00:00Z"),
            ("2012-08-28", "2012-08-28T00:00:00Z"),
            ("2012-08", "2012-08-01T00:00:00Z"),
            ("2012", "2012-01-01T00:00:00Z"),
        ];

        for (input, expected) in tests {
            let t = parse_time(input).unwrap_or_else(|e| panic!("{input}: {e}"));
            assert_eq!(format_canonical(t), expected, "input {input}");
        }
    }

    #[test]
    fn canonical_fractions_round_trip() {
        let tests = [
            ("2012-08-28T21:24:35.374651883Z", None),
            ("2012-08-28T21:24:35.37465188Z", None),
            ("2012-08-28T21:24:35.3746518Z", None),
            ("2012-08-28T21:24:35.374651Z", None),
            ("2012-08-28T21:24:35.37465Z", None),
            ("2012-08-28T21:24:35.3746Z", None),
            ("2012-08-28T21:24:35.374Z", None),
            ("2012-08-28T21:24:35.37Z", None),
            ("2012-08-28T21:24:35.3Z", None),
            ("2012-08-28T21:24:35.0Z", Some("2012-08-28T21:24:35Z")),
            ("2012-08-28T21:24:35.Z", Some("2012-08-28T21:24:35Z")),
            ("2012-08-28T21:24:35Z", None),
        ];

        for (input, expected) in tests {
            let t = parse_canonical_time(input).unwrap_or_else(|e| panic!("{input}: {e}"));
            assert_eq!(format_canonical(t), expected.unwrap_or(input));
        }
    }

    #[test]
    fn rejects_malformed_canonical_input() {
        let tests = [
            "ZZZZZZZZZZZZZZZZZZZZ",
            "ZZZZ-ZZ-ZZTZZ:ZZ:ZZZ",
            "2014-ZZ-ZZTZZ:ZZ:ZZZ",
            "2014-03-ZZTZZ:ZZ:ZZZ",
            "2014-03-14TZZ:ZZ:ZZZ",
            "2014-03-14T15:ZZ:ZZZ",
            "2014-03-14T15:09:ZZZ",
            "2014-03-14T15:09:26.S35897Z",
        ];
        for input in tests {
            assert!(parse_canonical_time(input).is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn rejects_the_unparseable() {
        assert!(parse_time("an hour ago").is_err());
        assert!(parse_time("99").is_err());
    }

    #[test]
    fn key_parsing() {
        assert_eq!(
            parse_key("2012-08-26T20:46:01.911627314Z"),
            1346013961911627314
        );
        // Small enough to be an ambiguous epoch, not canonical either.
        assert_eq!(parse_key("82488858158"), -1);
        assert_eq!(parse_key("not a time"), -1);
    }

    #[test]
    fn keys_round_trip_at_nanosecond_precision() {
        for key in [
            "2012-08-28T21:24:35.37465188Z",
            "2024-01-01T00:00:00Z",
            "1999-12-31T23:59:59.999999999Z",
        ] {
            let ns = parse_key(key);
            assert!(ns > 0);
            assert_eq!(format_key(ns), key);
        }
    }
}

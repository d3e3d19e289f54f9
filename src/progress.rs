//! Conversion of rclone output lines into typed [`Progress`] values.
//!
//! Two strategies are tried in order: the structured JSON log format
//! (`--use-json-log`) and the plain `Transferred:` stats text. Lines that
//! match neither are dropped. Parsing is pure and total: malformed input
//! yields `None`, never an error.

use crate::models::Progress;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn speed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([0-9.]+\s*(?:[KMGT]i?)?B?)/s").unwrap())
}

fn eta_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ETA\s+(\S+)").unwrap())
}

/// Parse one output line into a progress event, if it carries one.
pub fn parse_line(line: &str) -> Option<Progress> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(progress) = parse_structured(trimmed) {
        return Some(progress);
    }
    parse_textual(trimmed)
}

/// Strategy 1: JSON object, preferring its `stats` sub-object.
fn parse_structured(line: &str) -> Option<Progress> {
    let value: Value = serde_json::from_str(line).ok()?;
    let obj = value.as_object()?;

    let stats = match obj.get("stats") {
        Some(Value::Object(stats)) => stats,
        _ => obj,
    };

    let bytes = stats.get("bytes").and_then(Value::as_i64);
    let transfers = stats.get("transfers").and_then(Value::as_i64);

    // A JSON line with no counters is a plain log message, not a stats line.
    if bytes.is_none() && transfers.is_none() {
        return None;
    }

    let bytes_total = stats
        .get("totalBytes")
        .or_else(|| stats.get("estimatedBytes"))
        .and_then(Value::as_i64)
        .unwrap_or(0);

    let eta_seconds = match stats.get("eta") {
        Some(Value::Number(n)) => n.as_f64().map(|secs| secs.round() as i64),
        Some(Value::String(s)) => parse_duration(s),
        _ => None,
    };

    Some(Progress {
        bytes_transferred: bytes.unwrap_or(0),
        bytes_total,
        files_transferred: transfers.unwrap_or(0),
        files_total: stats
            .get("totalTransfers")
            .and_then(Value::as_i64)
            .unwrap_or(0),
        speed: stats.get("speed").and_then(Value::as_f64).unwrap_or(0.0),
        eta_seconds,
    })
}

/// Strategy 2: `Transferred: A / B, P%, S/s, ETA D` stats text.
///
/// rclone emits two flavours: a byte line where `A / B` carry binary units
/// and a file-count line where they are bare integers.
fn parse_textual(line: &str) -> Option<Progress> {
    let rest = line.split("Transferred:").nth(1)?;

    let mut progress = Progress::default();
    let mut matched = false;

    if let Some(pair) = rest.split(',').next() {
        let mut halves = pair.splitn(2, '/');
        let left = halves.next()?.trim();
        let right = halves.next()?.trim();

        if left.chars().all(|c| c.is_ascii_digit())
            && right.chars().all(|c| c.is_ascii_digit())
        {
            // File-count flavour: "Transferred: 15 / 20, 75%"
            progress.files_transferred = left.parse().ok()?;
            progress.files_total = right.parse().ok()?;
            matched = true;
        } else if let (Some(a), Some(b)) = (parse_size(left), parse_size(right)) {
            progress.bytes_transferred = a;
            progress.bytes_total = b;
            matched = true;
        }
    }

    if let Some(caps) = speed_re().captures(rest) {
        if let Some(speed) = parse_size(&caps[1]) {
            progress.speed = speed as f64;
        }
    }
    if let Some(caps) = eta_re().captures(rest) {
        progress.eta_seconds = parse_duration(&caps[1]);
    }

    matched.then_some(progress)
}

/// Parse a human byte size like `1.234 GiB` into bytes. Units are binary
/// multiples; a bare number is taken as bytes.
fn parse_size(text: &str) -> Option<i64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number.trim().parse().ok()?;

    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "KiB" | "K" => 1024.0,
        "MiB" | "M" => 1024.0 * 1024.0,
        "GiB" | "G" => 1024.0 * 1024.0 * 1024.0,
        "TiB" | "T" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };

    Some((value * multiplier).round() as i64)
}

/// Parse a duration like `2h30m15s`, `45s`, `2m`, or a bare number of
/// seconds. Returns `None` for anything else (rclone prints `-` while the
/// ETA is unknown).
pub fn parse_duration(text: &str) -> Option<i64> {
    let text = text.trim();
    if text.is_empty() || text == "-" {
        return None;
    }
    if text.chars().all(|c| c.is_ascii_digit()) {
        return text.parse().ok();
    }

    let mut total: i64 = 0;
    let mut number = String::new();
    let mut saw_component = false;

    for c in text.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        let value: i64 = number.parse().ok()?;
        number.clear();
        total += match c {
            'h' => value * 3600,
            'm' => value * 60,
            's' => value,
            _ => return None,
        };
        saw_component = true;
    }

    // Trailing digits without a unit suffix, e.g. "2m3"
    if !number.is_empty() || !saw_component {
        return None;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structured_stats_object() {
        let line = json!({
            "level": "info",
            "msg": "stats",
            "stats": {
                "bytes": 1_048_576,
                "totalBytes": 10_485_760,
                "transfers": 3,
                "totalTransfers": 12,
                "speed": 524_288.0,
                "eta": 18
            },
            "time": "2025-08-03T10:00:00Z"
        })
        .to_string();

        let progress = parse_line(&line).unwrap();
        assert_eq!(progress.bytes_transferred, 1_048_576);
        assert_eq!(progress.bytes_total, 10_485_760);
        assert_eq!(progress.files_transferred, 3);
        assert_eq!(progress.files_total, 12);
        assert_eq!(progress.speed, 524_288.0);
        assert_eq!(progress.eta_seconds, Some(18));
    }

    #[test]
    fn test_structured_bare_object_and_synonyms() {
        let line = json!({
            "bytes": 100,
            "estimatedBytes": 400,
            "transfers": 1,
            "eta": "2h30m15s"
        })
        .to_string();

        let progress = parse_line(&line).unwrap();
        assert_eq!(progress.bytes_transferred, 100);
        assert_eq!(progress.bytes_total, 400);
        assert_eq!(progress.eta_seconds, Some(9015));
    }

    #[test]
    fn test_structured_message_without_counters_is_dropped() {
        let line = r#"{"level":"info","msg":"Copied (new)","time":"2025-08-03T10:00:00Z"}"#;
        assert_eq!(parse_line(line), None);
    }

    #[test]
    fn test_textual_byte_line() {
        let line = "Transferred: 1.234 GiB / 10.000 GiB, 12%, 50.000 MiB/s, ETA 2m30s";
        let progress = parse_line(line).unwrap();

        let gib = 1024_f64 * 1024.0 * 1024.0;
        assert_eq!(progress.bytes_transferred, (1.234 * gib).round() as i64);
        assert_eq!(progress.bytes_total, (10.0 * gib).round() as i64);
        assert_eq!(progress.speed, 50.0 * 1024.0 * 1024.0);
        assert_eq!(progress.eta_seconds, Some(150));
    }

    #[test]
    fn test_textual_file_count_line() {
        let progress = parse_line("Transferred: 15 / 20, 75%").unwrap();
        assert_eq!(progress.files_transferred, 15);
        assert_eq!(progress.files_total, 20);
        assert_eq!(progress.bytes_transferred, 0);
    }

    #[test]
    fn test_textual_unknown_eta() {
        let line = "Transferred: 512 KiB / 4 MiB, 12%, 128 KiB/s, ETA -";
        let progress = parse_line(line).unwrap();
        assert_eq!(progress.bytes_transferred, 512 * 1024);
        assert_eq!(progress.eta_seconds, None);
    }

    #[test]
    fn test_unmatched_lines_are_dropped() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("Checks: 3 / 3, 100%"), None);
        assert_eq!(parse_line("Elapsed time: 1m32.1s"), None);
        assert_eq!(parse_line("not json {{{"), None);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1h02m03s"), Some(3723));
        assert_eq!(parse_duration("45s"), Some(45));
        assert_eq!(parse_duration("2m"), Some(120));
        assert_eq!(parse_duration("150"), Some(150));
        assert_eq!(parse_duration("-"), None);
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("2m3"), None);
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("100"), Some(100));
        assert_eq!(parse_size("1 KiB"), Some(1024));
        assert_eq!(parse_size("1.5 MiB"), Some(1_572_864));
        assert_eq!(parse_size("2 TiB"), Some(2_199_023_255_552));
        assert_eq!(parse_size("5 parsecs"), None);
    }
}

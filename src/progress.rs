//! Copy-tool stdout parsing (C4, §4.4). New code — the teacher's
//! `transfer/progress.rs` only models byte-counted progress state, not
//! parsing; this keeps its formatting idiom but adds the regex-based line
//! recognizer the spec requires. The parser is tolerant: unparseable lines
//! are ignored, and it is stateful only for the current filename and totals.

use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressTick {
    pub bytes_transferred: u64,
    pub percent: u8,
    pub speed: String,
    pub eta: String,
    pub xfr_index: Option<u32>,
    pub files_checked: Option<u64>,
    pub files_total: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemizeKind {
    Sent,
    Received,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemizeLine {
    pub kind: ItemizeKind,
    pub raw: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    pub files_total: Option<u64>,
    pub bytes_total: Option<u64>,
}

fn progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*(?P<bytes>[\d,]+)\s+(?P<pct>\d{1,3})%\s+(?P<speed>[\d.]+\S*?/s)\s+(?P<eta>\d+:\d{2}:\d{2})(?:\s+\(xfr#(?P<xfr>\d+),\s*to-chk=(?P<checked>\d+)/(?P<total>\d+)\))?",
        )
        .unwrap()
    })
}

fn file_list_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<n>\d+)\s+files to consider").unwrap())
}

/// Parse one line of copy-tool stdout into a progress tick, if it is one.
pub fn parse_line(line: &str) -> Option<ProgressTick> {
    let caps = progress_re().captures(line)?;
    let bytes: u64 = caps["bytes"].replace(',', "").parse().ok()?;
    let percent: u8 = caps["pct"].parse().ok()?;
    Some(ProgressTick {
        bytes_transferred: bytes,
        percent: percent.min(100),
        speed: caps["speed"].to_string(),
        eta: caps["eta"].to_string(),
        xfr_index: caps.name("xfr").and_then(|m| m.as_str().parse().ok()),
        files_checked: caps.name("checked").and_then(|m| m.as_str().parse().ok()),
        files_total: caps.name("total").and_then(|m| m.as_str().parse().ok()),
    })
}

/// Parse an itemize-changes line (`>` outbound, `<` inbound).
pub fn parse_itemize(line: &str) -> Option<ItemizeLine> {
    let first = line.chars().next()?;
    let kind = match first {
        '>' => ItemizeKind::Sent,
        '<' => ItemizeKind::Received,
        _ => return None,
    };
    Some(ItemizeLine { kind, raw: line.to_string() })
}

/// Parse the `"<N> files to consider"` line, if present.
pub fn parse_file_list(line: &str) -> Option<u64> {
    let caps = file_list_re().captures(line)?;
    caps["n"].parse().ok()
}

/// Stateful accumulator across a whole transfer's stdout, tracking the last
/// seen filename and file-list total.
#[derive(Debug, Default)]
pub struct StatefulParser {
    pub current_file: Option<String>,
    pub files_total: Option<u64>,
    last_tick: Option<ProgressTick>,
}

impl StatefulParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns a tick when the line was progress output.
    pub fn feed(&mut self, line: &str) -> Option<ProgressTick> {
        if let Some(n) = parse_file_list(line) {
            self.files_total = Some(n);
            return None;
        }
        if let Some(item) = parse_itemize(line) {
            // itemize lines carry the filename after the 11-char flag field.
            if item.raw.len() > 12 {
                self.current_file = Some(item.raw[12..].trim().to_string());
            }
            return None;
        }
        if let Some(tick) = parse_line(line) {
            self.last_tick = Some(tick.clone());
            return Some(tick);
        }
        None
    }

    /// Best-effort final stats from whatever this parser observed.
    pub fn finish(&self) -> Stats {
        Stats {
            files_total: self.files_total,
            bytes_total: self.last_tick.as_ref().map(|t| t.bytes_transferred),
        }
    }
}

/// Parse a complete captured output blob into final stats (§4.4 `parse_stats`).
pub fn parse_stats(output: &str) -> Option<Stats> {
    let mut parser = StatefulParser::new();
    for line in output.lines() {
        parser.feed(line);
    }
    let stats = parser.finish();
    if stats.files_total.is_none() && stats.bytes_total.is_none() {
        None
    } else {
        Some(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_line_with_xfr() {
        let line = "     32768  45%    1.20MB/s    0:00:12 (xfr#3, to-chk=7/10)";
        let tick = parse_line(line).unwrap();
        assert_eq!(tick.bytes_transferred, 32768);
        assert_eq!(tick.percent, 45);
        assert_eq!(tick.speed, "1.20MB/s");
        assert_eq!(tick.eta, "0:00:12");
        assert_eq!(tick.xfr_index, Some(3));
        assert_eq!(tick.files_checked, Some(7));
        assert_eq!(tick.files_total, Some(10));
    }

    #[test]
    fn parses_progress_line_without_xfr() {
        let line = "   1048576 100%  512.00kB/s    0:00:02";
        let tick = parse_line(line).unwrap();
        assert_eq!(tick.percent, 100);
        assert_eq!(tick.xfr_index, None);
    }

    #[test]
    fn ignores_unparseable_lines() {
        assert!(parse_line("sending incremental file list").is_none());
        assert!(parse_line("").is_none());
    }

    #[test]
    fn parses_file_list_line() {
        assert_eq!(parse_file_list("42 files to consider"), Some(42));
        assert!(parse_file_list("not a file list").is_none());
    }

    #[test]
    fn parses_itemize_lines() {
        let sent = parse_itemize(">f+++++++++ path/to/file.txt").unwrap();
        assert_eq!(sent.kind, ItemizeKind::Sent);
        let recv = parse_itemize("<f.st...... path/to/other.txt").unwrap();
        assert_eq!(recv.kind, ItemizeKind::Received);
        assert!(parse_itemize("regular line").is_none());
    }

    #[test]
    fn stateful_parser_tracks_progress_non_decreasing() {
        let mut parser = StatefulParser::new();
        parser.feed("10 files to consider");
        let t1 = parser.feed("   1000  10%    1.00MB/s    0:00:10").unwrap();
        let t2 = parser.feed("   5000  50%    1.00MB/s    0:00:05").unwrap();
        assert!(t2.bytes_transferred >= t1.bytes_transferred);
        let stats = parser.finish();
        assert_eq!(stats.files_total, Some(10));
        assert_eq!(stats.bytes_total, Some(5000));
    }
}

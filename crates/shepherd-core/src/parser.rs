//! Access-log line parser.
//!
//! Recognizes the combined access-log shape:
//!
//! ```text
//! <addr> <ident> <user> [<time>] "<method> <path> HTTP/<ver>" <status> <bytes> "<referrer>" "<agent>" [<response_time>]
//! ```
//!
//! Instead of compiling a regex, the line is walked with a small cursor that
//! understands bare tokens, `[...]` groups and `"..."` strings with backslash
//! escapes. Lines that do not fit still produce an entry: typed fields stay
//! empty and the level is guessed from configurable error marker words.

use std::net::SocketAddr;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};

use crate::model::{Level, LogEntry};

/// Tokens that mark an unstructured line as an error. Matched as whole
/// words, ignoring case.
pub const DEFAULT_ERROR_MARKERS: &[&str] = &["error", "fatal", "critical", "exception", "panic"];

/// Time formats accepted inside the brackets, tried in order.
const TIME_FORMAT_WITH_ZONE: &str = "%d/%b/%Y:%H:%M:%S %z";
const TIME_FORMAT_NAIVE: &str = "%d/%b/%Y:%H:%M:%S";

#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub error_markers: Vec<String>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            error_markers: DEFAULT_ERROR_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}

/// Converts raw lines into [`LogEntry`] values. Never rejects a line.
#[derive(Debug, Clone)]
pub struct AccessLogParser {
    markers: Vec<String>,
}

impl Default for AccessLogParser {
    fn default() -> Self {
        Self::new(&ParserConfig::default())
    }
}

impl AccessLogParser {
    pub fn new(config: &ParserConfig) -> Self {
        let markers = config
            .error_markers
            .iter()
            .map(|m| m.trim().to_lowercase())
            .filter(|m| !m.is_empty())
            .collect();
        Self { markers }
    }

    /// Parse one line received from `origin`.
    pub fn parse(&self, line: &str, origin: Option<SocketAddr>) -> LogEntry {
        let received_at = Utc::now();

        match parse_access_line(line) {
            Some(fields) => {
                let level = if fields.status >= 400 {
                    Level::Error
                } else {
                    Level::Success
                };
                LogEntry {
                    received_at,
                    origin,
                    timestamp: parse_time(fields.time),
                    source_address: Some(fields.source_address.to_string()),
                    method: Some(fields.method.to_string()),
                    path: Some(fields.path.to_string()),
                    protocol: Some(fields.protocol.to_string()),
                    status_code: Some(fields.status),
                    bytes_sent: Some(fields.bytes_sent),
                    referrer: Some(fields.referrer),
                    user_agent: Some(fields.user_agent),
                    response_time: fields.response_time,
                    raw: line.to_string(),
                    level,
                }
            }
            None => LogEntry {
                received_at,
                origin,
                timestamp: None,
                source_address: None,
                method: None,
                path: None,
                protocol: None,
                status_code: None,
                bytes_sent: None,
                referrer: None,
                user_agent: None,
                response_time: None,
                raw: line.to_string(),
                level: self.fallback_level(line),
            },
        }
    }

    fn fallback_level(&self, line: &str) -> Level {
        let lowered = line.to_lowercase();
        if self.markers.iter().any(|m| contains_token(&lowered, m)) {
            Level::Error
        } else {
            Level::Info
        }
    }
}

/// True if `token` occurs in `haystack` without a letter or digit directly
/// before or after it.
fn contains_token(haystack: &str, token: &str) -> bool {
    haystack.match_indices(token).any(|(start, m)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + m.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

/// Fields of a line that matched the grammar.
#[derive(Debug)]
struct AccessFields<'a> {
    source_address: &'a str,
    time: &'a str,
    method: &'a str,
    path: &'a str,
    protocol: &'a str,
    status: u16,
    bytes_sent: u64,
    referrer: String,
    user_agent: String,
    response_time: Option<f64>,
}

fn parse_access_line(line: &str) -> Option<AccessFields<'_>> {
    let mut cursor = Cursor::new(line);

    let source_address = cursor.token()?;
    let _ident = cursor.token()?;
    let _user = cursor.token()?;
    let time = cursor.bracketed()?;

    let request = cursor.quoted_raw()?;
    let mut parts = request.split_whitespace();
    let method = parts.next()?;
    let path = parts.next()?;
    let protocol = parts.next()?.strip_prefix("HTTP/")?;
    if parts.next().is_some() {
        return None;
    }

    let status = cursor
        .token()?
        .parse::<u16>()
        .ok()
        .filter(|s| (100..=599).contains(s))?;
    let bytes_sent = match cursor.token()? {
        "-" => 0,
        t => t.parse::<u64>().ok()?,
    };
    let referrer = unescape(cursor.quoted_raw()?);
    let user_agent = unescape(cursor.quoted_raw()?);

    // Anything after the agent is tolerated; a leading decimal is taken as
    // the request duration.
    let response_time = cursor.token().and_then(|t| t.parse::<f64>().ok());

    Some(AccessFields {
        source_address,
        time,
        method,
        path,
        protocol,
        status,
        bytes_sent,
        referrer,
        user_agent,
        response_time,
    })
}

fn parse_time(s: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(t) = DateTime::parse_from_str(s, TIME_FORMAT_WITH_ZONE) {
        return Some(t);
    }
    NaiveDateTime::parse_from_str(s, TIME_FORMAT_NAIVE)
        .ok()
        .map(|t| t.and_utc().fixed_offset())
}

/// Resolve `\"` and `\\` escapes inside a quoted field.
fn unescape(s: &str) -> String {
    if !s.contains('\\') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Forward-only scanner over a line.
struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(line: &'a str) -> Self {
        Self { rest: line }
    }

    fn skip_whitespace(&mut self) {
        self.rest = self.rest.trim_start();
    }

    /// Next run of non-whitespace characters.
    fn token(&mut self) -> Option<&'a str> {
        self.skip_whitespace();
        if self.rest.is_empty() {
            return None;
        }
        let end = self
            .rest
            .find(char::is_whitespace)
            .unwrap_or(self.rest.len());
        let (token, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(token)
    }

    /// Contents of the next `[...]` group.
    fn bracketed(&mut self) -> Option<&'a str> {
        self.skip_whitespace();
        let inner = self.rest.strip_prefix('[')?;
        let end = inner.find(']')?;
        self.rest = &inner[end + 1..];
        Some(&inner[..end])
    }

    /// Contents of the next `"..."` string, escapes left in place.
    fn quoted_raw(&mut self) -> Option<&'a str> {
        self.skip_whitespace();
        let inner = self.rest.strip_prefix('"')?;
        let mut escaped = false;
        for (i, c) in inner.char_indices() {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => {
                    self.rest = &inner[i + 1..];
                    return Some(&inner[..i]);
                }
                _ => {}
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    const LINE_200: &str =
        r#"10.0.0.1 - - [10/Oct/2023:13:55:36] "GET /api HTTP/1.1" 200 612 "-" "curl/7.0""#;

    #[test]
    fn test_parse_success_line() {
        let parser = AccessLogParser::default();
        let entry = parser.parse(LINE_200, None);

        assert!(entry.is_structured());
        assert_eq!(entry.source_address.as_deref(), Some("10.0.0.1"));
        assert_eq!(entry.method.as_deref(), Some("GET"));
        assert_eq!(entry.path.as_deref(), Some("/api"));
        assert_eq!(entry.protocol.as_deref(), Some("1.1"));
        assert_eq!(entry.status_code, Some(200));
        assert_eq!(entry.bytes_sent, Some(612));
        assert_eq!(entry.referrer.as_deref(), Some("-"));
        assert_eq!(entry.user_agent.as_deref(), Some("curl/7.0"));
        assert_eq!(entry.level, Level::Success);
        assert_eq!(entry.raw, LINE_200);

        let ts = entry.timestamp.unwrap();
        assert_eq!((ts.day(), ts.month(), ts.year()), (10, 10, 2023));
        assert_eq!((ts.hour(), ts.minute(), ts.second()), (13, 55, 36));
        assert_eq!(ts.offset().local_minus_utc(), 0);
    }

    #[test]
    fn test_parse_server_error_is_error_level() {
        let parser = AccessLogParser::default();
        let line = r#"10.0.0.2 - - [10/Oct/2023:13:55:36 +0200] "POST /orders HTTP/2.0" 500 0 "https://example.com" "Mozilla/5.0""#;
        let entry = parser.parse(line, None);

        assert_eq!(entry.status_code, Some(500));
        assert_eq!(entry.level, Level::Error);
        assert_eq!(entry.protocol.as_deref(), Some("2.0"));
        assert_eq!(entry.timestamp.unwrap().offset().local_minus_utc(), 7200);
    }

    #[test]
    fn test_client_error_boundary() {
        let parser = AccessLogParser::default();
        let line_399 = LINE_200.replace(" 200 ", " 399 ");
        let line_400 = LINE_200.replace(" 200 ", " 400 ");
        assert_eq!(parser.parse(&line_399, None).level, Level::Success);
        assert_eq!(parser.parse(&line_400, None).level, Level::Error);
    }

    #[test]
    fn test_garbage_falls_back_to_info() {
        let parser = AccessLogParser::default();
        let entry = parser.parse("random garbage text", None);

        assert!(!entry.is_structured());
        assert_eq!(entry.raw, "random garbage text");
        assert_eq!(entry.level, Level::Info);
        assert!(entry.method.is_none());
        assert!(entry.status_code.is_none());
        assert!(entry.timestamp.is_none());
    }

    #[test]
    fn test_fallback_error_marker_case_insensitive() {
        let parser = AccessLogParser::default();
        let entry = parser.parse("2023-10-10 worker crashed: Fatal ERROR in handler", None);
        assert_eq!(entry.level, Level::Error);
        assert!(entry.status_code.is_none());
    }

    #[test]
    fn test_error_marker_needs_word_boundary() {
        let parser = AccessLogParser::default();
        assert_eq!(parser.parse("terrorist drill scheduled", None).level, Level::Info);
        assert_eq!(parser.parse("errorless run, 0 faults", None).level, Level::Info);
        assert_eq!(parser.parse("[error] upstream timed out", None).level, Level::Error);
        assert_eq!(parser.parse("code=panic_on_oom", None).level, Level::Error);
        assert_eq!(parser.parse("critical", None).level, Level::Error);
    }

    #[test]
    fn test_contains_token() {
        assert!(contains_token("out of memory: exit", "out of memory"));
        assert!(!contains_token("timeout of memory", "out of memory"));
        assert!(contains_token("x error x error", "error"));
        assert!(!contains_token("", "error"));
    }

    #[test]
    fn test_custom_markers_replace_defaults() {
        let parser = AccessLogParser::new(&ParserConfig {
            error_markers: vec!["OOPS".to_string(), "  ".to_string()],
        });
        assert_eq!(parser.parse("oops, disk full", None).level, Level::Error);
        assert_eq!(parser.parse("error but not a marker", None).level, Level::Info);
    }

    #[test]
    fn test_escaped_quote_in_user_agent() {
        let parser = AccessLogParser::default();
        let line = r#"1.2.3.4 - bob [10/Oct/2023:13:55:36 +0000] "GET / HTTP/1.0" 304 - "-" "agent \"quoted\" v1""#;
        let entry = parser.parse(line, None);

        assert_eq!(entry.user_agent.as_deref(), Some(r#"agent "quoted" v1"#));
        assert_eq!(entry.bytes_sent, Some(0));
        assert_eq!(entry.level, Level::Success);
    }

    #[test]
    fn test_trailing_response_time() {
        let parser = AccessLogParser::default();
        let line = format!("{} 0.734", LINE_200);
        let entry = parser.parse(&line, None);
        assert_eq!(entry.response_time, Some(0.734));

        let line = format!("{} upstream=backend-1", LINE_200);
        let entry = parser.parse(&line, None);
        assert!(entry.is_structured());
        assert_eq!(entry.response_time, None);
    }

    #[test]
    fn test_unparsable_time_keeps_structure() {
        let parser = AccessLogParser::default();
        let line = LINE_200.replace("10/Oct/2023:13:55:36", "yesterday");
        let entry = parser.parse(&line, None);
        assert!(entry.is_structured());
        assert!(entry.timestamp.is_none());
    }

    #[test]
    fn test_structural_mismatches_fall_back() {
        let parser = AccessLogParser::default();
        let cases = [
            // status out of range
            LINE_200.replace(" 200 ", " 999 "),
            // status not numeric
            LINE_200.replace(" 200 ", " OK "),
            // request line without protocol
            LINE_200.replace("GET /api HTTP/1.1", "GET /api"),
            // unterminated user agent
            LINE_200.trim_end_matches('"').to_string(),
            // missing brackets
            LINE_200.replace('[', "").replace(']', ""),
            String::new(),
        ];
        for line in cases {
            let entry = parser.parse(&line, None);
            assert!(!entry.is_structured(), "unexpected match: {line}");
            assert_eq!(entry.raw, line);
        }
    }

    #[test]
    fn test_origin_is_recorded() {
        let parser = AccessLogParser::default();
        let origin: SocketAddr = "192.168.1.5:40000".parse().unwrap();
        let entry = parser.parse("anything", Some(origin));
        assert_eq!(entry.origin, Some(origin));
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(r#"a\"b"#), r#"a"b"#);
        assert_eq!(unescape(r"a\\b"), r"a\b");
        assert_eq!(unescape("trailing\\"), "trailing\\");
        assert_eq!(unescape("plain"), "plain");
    }
}

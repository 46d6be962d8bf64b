//! Per-request upstream session: cookie parsing, `lname` extraction, and
//! the millisecond timer the upstream expects as an anti-cache nonce.

use std::collections::HashMap;

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // Ordered: the first matching pattern wins.
    static ref LNAME_PATTERNS: Vec<Regex> = vec![
        Regex::new(r#"lname=([^&"'\s]+)"#).unwrap(),
        Regex::new(r#"xmlhttp\.send\("[^"]*lname=([^&"'\s]+)""#).unwrap(),
        Regex::new(r"MyUpdate\('[^']*','[^']*','[^']*',\d+,(\d+)\)").unwrap(),
        Regex::new(r#"name=['"]lname['"]\s*value=['"]([^'"]+)['"]"#).unwrap(),
    ];
}

/// Reconstructed upstream session for one inbound request.
///
/// `lname` stays stable for the request's lifetime; the timer is re-minted
/// per outbound call via [`fresh_timer`].
#[derive(Debug, Clone)]
pub struct Session {
    pub cookies: HashMap<String, String>,
    pub lname: String,
}

/// Parses an opaque `name=value; name2=value2` cookie string into a map.
///
/// Whitespace around each pair is trimmed and pairs without `=` are dropped.
pub fn parse_cookie_header(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Extracts the `lname` session token from the base timetable page.
///
/// A capture containing a comma is truncated at the first comma; the
/// upstream occasionally appends positional arguments after the token.
pub fn extract_lname(html: &str) -> Option<String> {
    for pattern in LNAME_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(html) {
            let raw = captures.get(1)?.as_str();
            let lname = raw.split(',').next().unwrap_or(raw);
            if !lname.is_empty() {
                return Some(lname.to_string());
            }
        }
    }
    None
}

/// Current wall-clock milliseconds as a decimal string.
pub fn fresh_timer() -> String {
    Utc::now().timestamp_millis().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_parsing_is_idempotent_and_trims_whitespace() {
        let raw = " ASP.NET_SessionId=abc123 ;  studentid = 42 ; malformed ; =orphan";
        let first = parse_cookie_header(raw);
        let second = parse_cookie_header(raw);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(first["ASP.NET_SessionId"], "abc123");
        assert_eq!(first["studentid"], "42");
    }

    #[test]
    fn empty_cookie_string_parses_to_an_empty_map() {
        assert!(parse_cookie_header("").is_empty());
        assert!(parse_cookie_header(" ; ; ").is_empty());
    }

    #[test]
    fn lname_is_found_in_query_string_form() {
        let html = r#"<script>var u = "page.asp?lname=Ford62859,20";</script>"#;
        assert_eq!(extract_lname(html).as_deref(), Some("Ford62859"));
    }

    #[test]
    fn lname_is_found_in_xmlhttp_send_call() {
        let html = r#"xmlhttp.send("fname=Henry&lname=Ford12345&timer=1")"#;
        assert_eq!(extract_lname(html).as_deref(), Some("Ford12345"));
    }

    #[test]
    fn lname_is_found_in_myupdate_tail_integer() {
        let html = "MyUpdate('/i/udvalg.asp','x','y',1,987654)";
        assert_eq!(extract_lname(html).as_deref(), Some("987654"));
    }

    #[test]
    fn lname_is_found_in_hidden_input() {
        let html = r#"<input type="hidden" name="lname" value="Ford999">"#;
        assert_eq!(extract_lname(html).as_deref(), Some("Ford999"));
    }

    #[test]
    fn earlier_pattern_wins_when_several_match() {
        let html = concat!(
            r#"<input type="hidden" name="lname" value="FromInput">"#,
            r#"<script>go("?lname=FromQuery&x=1")</script>"#,
        );
        assert_eq!(extract_lname(html).as_deref(), Some("FromQuery"));
    }

    #[test]
    fn missing_lname_yields_none() {
        assert_eq!(extract_lname("<html><body>login</body></html>"), None);
    }

    #[test]
    fn timers_are_monotonic_within_a_request() {
        let t1: i64 = fresh_timer().parse().unwrap();
        let t2: i64 = fresh_timer().parse().unwrap();
        assert!(t2 >= t1);
    }
}

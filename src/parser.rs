use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use url::Url;

use crate::types::{Descriptor, ProbeTarget};

/// Secrets longer than this are treated as template junk.
pub const MAX_SECRET_LEN: usize = 170;

/// A run of this many `A`s marks a placeholder secret.
const PLACEHOLDER_RUN: &str = "AAAAAAAAAAAAAAAAAAAA";

/// Classification of one input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Valid(Descriptor),
    /// Not a usable link: no scheme, bad URL, missing or invalid field.
    Malformed,
    /// Well-formed link whose secret is a known non-functional template.
    PlaceholderRejected,
}

/// Result of parsing a whole block of text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedInput {
    /// Valid descriptors in input order.
    pub descriptors: Vec<Descriptor>,
    /// Lines rejected because of a placeholder secret.
    pub skipped: usize,
    /// Non-blank lines rejected as garbage.
    pub malformed: usize,
    /// Entries dropped by [`ParsedInput::dedup`].
    pub duplicates: usize,
}

impl ParsedInput {
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Drop repeated `(server, port, secret)` triples, keeping the first occurrence.
    pub fn dedup(mut self) -> Self {
        let mut seen = HashSet::new();
        let before = self.descriptors.len();
        self.descriptors.retain(|d| {
            seen.insert((
                d.server().to_ascii_lowercase(),
                d.port(),
                d.secret().to_string(),
            ))
        });
        self.duplicates += before - self.descriptors.len();
        self
    }
}

/// Parse one raw line into a descriptor.
///
/// The line is trimmed and the first `.&` (a common copy/paste corruption)
/// is turned into `&`. The line must then be a URL carrying `server`, `port`
/// and `secret` query parameters.
pub fn parse_line(raw: &str) -> ParseOutcome {
    let clean = raw.trim().replacen(".&", "&", 1);
    if !clean.contains("://") {
        return ParseOutcome::Malformed;
    }

    let Ok(url) = Url::parse(&clean) else {
        return ParseOutcome::Malformed;
    };

    let server = query_param(&url, "server");
    let port = query_param(&url, "port").and_then(|p| parse_port(&p));
    let secret = query_param(&url, "secret");

    let (Some(server), Some(port), Some(secret)) = (server, port, secret) else {
        return ParseOutcome::Malformed;
    };
    if server.is_empty() || secret.is_empty() {
        return ParseOutcome::Malformed;
    }

    if is_placeholder_secret(&secret) {
        return ParseOutcome::PlaceholderRejected;
    }

    ParseOutcome::Valid(Descriptor::new(
        ProbeTarget {
            server,
            port,
            secret,
        },
        clean,
    ))
}

/// Parse a block of text, one candidate per line.
pub fn parse_input(s: &str) -> ParsedInput {
    let mut out = ParsedInput::default();
    for line in s.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line) {
            ParseOutcome::Valid(d) => out.descriptors.push(d),
            ParseOutcome::Malformed => out.malformed += 1,
            ParseOutcome::PlaceholderRejected => out.skipped += 1,
        }
    }
    out
}

/// Load and parse candidates from a file.
pub fn load_input_from_path(path: impl AsRef<Path>) -> Result<ParsedInput> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read input file: {}", path.as_ref().display()))?;
    Ok(parse_input(&content))
}

/// True when the secret is over-long or contains the 20-`A` template run.
pub fn is_placeholder_secret(secret: &str) -> bool {
    secret.chars().count() > MAX_SECRET_LEN || secret.contains(PLACEHOLDER_RUN)
}

fn query_param(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Leading-integer port parsing: `" 443"` and `"443abc"` both yield 443.
fn parse_port(s: &str) -> Option<u16> {
    let s = s.trim_start();
    let (negative, rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let digits = &rest[..end];
    if digits.is_empty() || negative {
        return None;
    }
    let val: u32 = digits.parse().ok()?;
    if val == 0 || val > 65535 {
        return None;
    }
    Some(val as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid(line: &str) -> Descriptor {
        match parse_line(line) {
            ParseOutcome::Valid(d) => d,
            other => panic!("expected valid descriptor for {line:?}, got {other:?}"),
        }
    }

    #[test]
    fn parses_tg_link() {
        let d = valid("tg://proxy?server=1.2.3.4&port=443&secret=abc123");
        assert_eq!(d.server(), "1.2.3.4");
        assert_eq!(d.port(), 443);
        assert_eq!(d.secret(), "abc123");
        assert_eq!(d.original(), "tg://proxy?server=1.2.3.4&port=443&secret=abc123");
    }

    #[test]
    fn parses_https_link_with_whitespace() {
        let d = valid("   https://t.me/proxy?server=proxy.example.org&port=8443&secret=ee00  \t");
        assert_eq!(d.server(), "proxy.example.org");
        assert_eq!(d.port(), 8443);
        assert_eq!(
            d.original(),
            "https://t.me/proxy?server=proxy.example.org&port=8443&secret=ee00"
        );
    }

    #[test]
    fn normalizes_dot_ampersand_once() {
        let d = valid("tg://proxy?server=1.2.3.4.&port=443&secret=abc");
        assert_eq!(d.server(), "1.2.3.4");
        assert_eq!(d.original(), "tg://proxy?server=1.2.3.4&port=443&secret=abc");
    }

    #[test]
    fn port_uses_leading_integer() {
        assert_eq!(parse_port("443"), Some(443));
        assert_eq!(parse_port(" 443"), Some(443));
        assert_eq!(parse_port("443abc"), Some(443));
        assert_eq!(parse_port("+80"), Some(80));
        assert_eq!(parse_port("abc"), None);
        assert_eq!(parse_port("0"), None);
        assert_eq!(parse_port("-1"), None);
        assert_eq!(parse_port("65536"), None);
        assert_eq!(parse_port("99999999999"), None);
        assert_eq!(parse_port("65535"), Some(65535));
    }

    #[test]
    fn missing_fields_are_malformed() {
        assert_eq!(parse_line(""), ParseOutcome::Malformed);
        assert_eq!(parse_line("1.2.3.4:443"), ParseOutcome::Malformed);
        assert_eq!(
            parse_line("tg://proxy?port=443&secret=abc"),
            ParseOutcome::Malformed
        );
        assert_eq!(
            parse_line("tg://proxy?server=&port=443&secret=abc"),
            ParseOutcome::Malformed
        );
        assert_eq!(
            parse_line("tg://proxy?server=1.2.3.4&secret=abc"),
            ParseOutcome::Malformed
        );
        assert_eq!(
            parse_line("tg://proxy?server=1.2.3.4&port=443"),
            ParseOutcome::Malformed
        );
        assert_eq!(
            parse_line("tg://proxy?server=1.2.3.4&port=443&secret="),
            ParseOutcome::Malformed
        );
        assert_eq!(parse_line("://"), ParseOutcome::Malformed);
    }

    #[test]
    fn placeholder_secrets_are_rejected() {
        let long = "a".repeat(171);
        assert_eq!(
            parse_line(&format!("tg://proxy?server=h&port=1&secret={long}")),
            ParseOutcome::PlaceholderRejected
        );
        let at_limit = "a".repeat(170);
        assert!(matches!(
            parse_line(&format!("tg://proxy?server=h&port=1&secret={at_limit}")),
            ParseOutcome::Valid(_)
        ));
        let template = format!("ee{}00", "A".repeat(20));
        assert_eq!(
            parse_line(&format!("tg://proxy?server=h&port=1&secret={template}")),
            ParseOutcome::PlaceholderRejected
        );
        let short_run = format!("ee{}00", "A".repeat(19));
        assert!(matches!(
            parse_line(&format!("tg://proxy?server=h&port=1&secret={short_run}")),
            ParseOutcome::Valid(_)
        ));
    }

    #[test]
    fn parse_input_counts_each_category() {
        let input = format!(
            "tg://proxy?server=a&port=1&secret=s1\n\
             \n\
             not a link\n\
             tg://proxy?server=b&port=2&secret={}\n\
             tg://proxy?server=c&port=3&secret=s3\n",
            "A".repeat(25)
        );
        let parsed = parse_input(&input);
        assert_eq!(parsed.descriptors.len(), 2);
        assert_eq!(parsed.skipped, 1);
        assert_eq!(parsed.malformed, 1);
        assert_eq!(parsed.descriptors[0].server(), "a");
        assert_eq!(parsed.descriptors[1].server(), "c");
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let input = "tg://proxy?server=A.example&port=1&secret=s\n\
                     https://t.me/proxy?server=a.example&port=1&secret=s\n\
                     tg://proxy?server=a.example&port=2&secret=s\n";
        let parsed = parse_input(input).dedup();
        assert_eq!(parsed.descriptors.len(), 2);
        assert_eq!(parsed.duplicates, 1);
        assert!(parsed.descriptors[0].original().starts_with("tg://"));
    }
}

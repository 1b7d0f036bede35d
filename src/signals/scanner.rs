//! Incremental scanner for phase sentinel markers.

use std::sync::LazyLock;

use regex::Regex;

use super::types::{Completion, Sentinel};

const COMPLETE_TAG: &str = "phase_complete";
const BLOCKED_TAG: &str = "phase_blocked";

/// Upper bound on buffered text while waiting for a closing tag.
const MAX_BUFFER: usize = 256 * 1024;

static VERDICT_ATTR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"verdict\s*=\s*["']?([A-Za-z]+)["']?"#).unwrap());

/// Scans streamed agent output for `phase_complete` / `phase_blocked` markers.
///
/// Chunks may split a marker anywhere, including inside the tag name, and
/// may interleave unrelated text. The scanner keeps only the suffix that
/// could still become part of a marker.
#[derive(Debug, Default)]
pub struct SentinelScanner {
    buf: String,
}

impl SentinelScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk. Returns the first complete marker, if any.
    pub fn feed(&mut self, chunk: &str) -> Option<Sentinel> {
        self.buf.push_str(chunk);
        self.scan()
    }

    /// Discard any partial marker state.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    fn scan(&mut self) -> Option<Sentinel> {
        loop {
            let Some(start) = find_open(&self.buf) else {
                self.keep_possible_prefix();
                return None;
            };
            if start > 0 {
                self.buf.drain(..start);
            }

            let tag = if self.buf[1..].starts_with(COMPLETE_TAG) {
                COMPLETE_TAG
            } else {
                BLOCKED_TAG
            };
            let after_name = 1 + tag.len();

            // `<phase_completed>` and the like are not markers.
            match self.buf[after_name..].chars().next() {
                None => return None,
                Some(c) if c == '>' || c == '/' || c.is_whitespace() => {}
                Some(_) => {
                    self.buf.drain(..1);
                    continue;
                }
            }

            let Some(open_end) = self.buf.find('>') else {
                return self.wait_or_drop();
            };
            let open_tag = &self.buf[..open_end];
            let verdict = VERDICT_ATTR_REGEX
                .captures(open_tag)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_lowercase());

            if open_tag.ends_with('/') {
                self.buf.drain(..=open_end);
                return Some(make_sentinel(tag, String::new(), verdict));
            }

            let close = format!("</{}>", tag);
            let Some(rel) = self.buf[open_end + 1..].find(&close) else {
                return self.wait_or_drop();
            };
            let body_end = open_end + 1 + rel;
            let body = self.buf[open_end + 1..body_end].trim().to_string();
            self.buf.drain(..body_end + close.len());
            return Some(make_sentinel(tag, body, verdict));
        }
    }

    /// An opening tag is buffered but its end hasn't arrived yet.
    fn wait_or_drop(&mut self) -> Option<Sentinel> {
        if self.buf.len() > MAX_BUFFER {
            tracing::warn!(
                buffered = self.buf.len(),
                "Dropping unterminated sentinel marker"
            );
            self.buf.drain(..1);
            return self.scan();
        }
        None
    }

    fn keep_possible_prefix(&mut self) {
        match self.buf.rfind('<') {
            Some(pos) if is_tag_prefix(&self.buf[pos..]) => {
                self.buf.drain(..pos);
            }
            _ => self.buf.clear(),
        }
    }
}

fn find_open(buf: &str) -> Option<usize> {
    let complete = buf.find(&format!("<{}", COMPLETE_TAG));
    let blocked = buf.find(&format!("<{}", BLOCKED_TAG));
    match (complete, blocked) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn is_tag_prefix(fragment: &str) -> bool {
    let rest = &fragment[1..];
    COMPLETE_TAG.starts_with(rest) || BLOCKED_TAG.starts_with(rest)
}

fn make_sentinel(tag: &str, body: String, verdict: Option<String>) -> Sentinel {
    if tag == COMPLETE_TAG {
        Sentinel::Complete(Completion { body, verdict })
    } else {
        Sentinel::Blocked { reason: body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(chunks: &[&str]) -> Option<Sentinel> {
        let mut scanner = SentinelScanner::new();
        chunks.iter().find_map(|c| scanner.feed(c))
    }

    #[test]
    fn test_complete_in_one_chunk() {
        let s = scan_all(&["All done. <phase_complete>true</phase_complete> bye"]);
        assert_eq!(
            s,
            Some(Sentinel::Complete(Completion {
                body: "true".into(),
                verdict: None
            }))
        );
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let s = scan_all(&["work work <pha", "se_blo", "cked>need the API ", "key</phase_bl", "ocked>"]);
        assert_eq!(
            s,
            Some(Sentinel::Blocked {
                reason: "need the API key".into()
            })
        );
    }

    #[test]
    fn test_split_on_every_character() {
        let text = "noise <b>x</b> <phase_complete verdict=\"pass\">ok</phase_complete>";
        let mut scanner = SentinelScanner::new();
        let mut found = None;
        for ch in text.chars() {
            if let Some(s) = scanner.feed(&ch.to_string()) {
                found = Some(s);
                break;
            }
        }
        assert_eq!(
            found,
            Some(Sentinel::Complete(Completion {
                body: "ok".into(),
                verdict: Some("pass".into())
            }))
        );
    }

    #[test]
    fn test_self_closing_marker() {
        let s = scan_all(&["<phase_complete/>"]).unwrap();
        assert!(s.is_complete());
    }

    #[test]
    fn test_similar_tag_names_are_ignored() {
        assert_eq!(scan_all(&["<phase_completed>x</phase_completed>"]), None);
        assert_eq!(scan_all(&["<phase>x</phase>"]), None);
    }

    #[test]
    fn test_unterminated_marker_is_held() {
        let mut scanner = SentinelScanner::new();
        assert_eq!(scanner.feed("<phase_complete>still writing"), None);
        assert_eq!(scanner.feed(" more"), None);
        let s = scanner.feed("</phase_complete>").unwrap();
        assert_eq!(
            s,
            Sentinel::Complete(Completion {
                body: "still writing more".into(),
                verdict: None
            })
        );
    }

    #[test]
    fn test_first_marker_wins() {
        let s = scan_all(&["<phase_blocked>a</phase_blocked><phase_complete>b</phase_complete>"]);
        assert_eq!(s, Some(Sentinel::Blocked { reason: "a".into() }));
    }

    #[test]
    fn test_noise_does_not_grow_buffer() {
        let mut scanner = SentinelScanner::new();
        for _ in 0..1000 {
            assert_eq!(scanner.feed("lots of text with <tags> and < signs "), None);
        }
        assert!(scanner.buf.len() < 64);
    }

    #[test]
    fn test_multibyte_text_around_marker() {
        let s = scan_all(&["héllo wörld ✓ <phase_blocked>naïve ", "question</phase_blocked>"]);
        assert_eq!(
            s,
            Some(Sentinel::Blocked {
                reason: "naïve question".into()
            })
        );
    }
}

//! Streaming structural scanner for markup fragments.
//!
//! Finds where a balanced fragment ends without building a tree. Every
//! verdict depends only on bytes already seen: whenever more input could
//! change the answer the scanner reports [`Scan::Incomplete`].

use std::ops::Range;

/// Outcome of scanning from an open marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Scan {
    /// A balanced fragment ends at `end`; `name` spans the root tag name.
    Complete { end: usize, name: Range<usize> },
    /// A top-level comment, declaration or processing instruction ends at `end`.
    Skip { end: usize },
    /// More bytes are needed before anything can be decided.
    Incomplete,
    /// The fragment cannot become well-formed; scanning resumes at `resume`.
    Malformed { resume: usize, reason: &'static str },
}

/// Result of matching a literal at a position.
enum Prefix {
    Yes,
    No,
    TooShort,
}

fn prefix(buf: &[u8], at: usize, pat: &[u8]) -> Prefix {
    let available = &buf[at.min(buf.len())..];
    let n = available.len().min(pat.len());
    if available[..n] != pat[..n] {
        Prefix::No
    } else if n < pat.len() {
        Prefix::TooShort
    } else {
        Prefix::Yes
    }
}

fn find(buf: &[u8], from: usize, pat: &[u8]) -> Option<usize> {
    buf.get(from..)?
        .windows(pat.len())
        .position(|w| w == pat)
        .map(|p| from + p)
}

const fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b':' || b >= 0x80
}

const fn is_name_char(b: u8) -> bool {
    is_name_start(b) || b.is_ascii_digit() || b == b'-' || b == b'.'
}

/// Where a tag ended.
enum TagEnd {
    Open { end: usize, self_closing: bool },
    Incomplete,
    Malformed { resume: usize, reason: &'static str },
}

/// Scans the attributes of an open tag starting after its name.
fn scan_open_tag(buf: &[u8], mut i: usize) -> TagEnd {
    while i < buf.len() {
        match buf[i] {
            quote @ (b'"' | b'\'') => match buf[i + 1..].iter().position(|&b| b == quote) {
                Some(p) => i += p + 2,
                None => return TagEnd::Incomplete,
            },
            b'>' => {
                return TagEnd::Open {
                    end: i + 1,
                    self_closing: false,
                };
            }
            b'/' => match buf.get(i + 1) {
                Some(b'>') => {
                    return TagEnd::Open {
                        end: i + 2,
                        self_closing: true,
                    };
                }
                Some(_) => {
                    return TagEnd::Malformed {
                        resume: i + 1,
                        reason: "stray '/' in tag",
                    };
                }
                None => return TagEnd::Incomplete,
            },
            b'<' => {
                return TagEnd::Malformed {
                    resume: i,
                    reason: "unterminated tag",
                };
            }
            _ => i += 1,
        }
    }
    TagEnd::Incomplete
}

/// Scans one fragment whose open marker `<` sits at `start`.
pub(crate) fn scan_fragment(buf: &[u8], start: usize) -> Scan {
    debug_assert_eq!(buf.get(start), Some(&b'<'));

    let mut stack: Vec<Range<usize>> = Vec::new();
    let mut root: Option<Range<usize>> = None;
    let mut i = start;

    loop {
        // `i` always sits on a '<' here.
        let Some(&next) = buf.get(i + 1) else {
            return Scan::Incomplete;
        };

        let after = match next {
            b'!' => {
                let (open, close): (&[u8], &[u8]) = match prefix(buf, i, b"<!--") {
                    Prefix::Yes => (b"<!--", b"-->"),
                    Prefix::TooShort => return Scan::Incomplete,
                    Prefix::No => match prefix(buf, i, b"<![CDATA[") {
                        Prefix::Yes => (b"<![CDATA[", b"]]>"),
                        Prefix::TooShort => return Scan::Incomplete,
                        Prefix::No => (b"<!", b">"),
                    },
                };
                match find(buf, i + open.len(), close) {
                    Some(p) => p + close.len(),
                    None => return Scan::Incomplete,
                }
            }
            b'?' => match find(buf, i + 2, b"?>") {
                Some(p) => p + 2,
                None => return Scan::Incomplete,
            },
            b'/' => {
                let name_start = i + 2;
                let mut j = name_start;
                while j < buf.len() && is_name_char(buf[j]) {
                    j += 1;
                }
                let name = name_start..j;
                while j < buf.len() && buf[j].is_ascii_whitespace() {
                    j += 1;
                }
                match buf.get(j) {
                    None => return Scan::Incomplete,
                    Some(b'>') => {}
                    Some(_) => {
                        return Scan::Malformed {
                            resume: j,
                            reason: "invalid close tag",
                        };
                    }
                }
                let end = j + 1;
                let Some(open) = stack.pop() else {
                    return Scan::Malformed {
                        resume: end,
                        reason: "close tag without open tag",
                    };
                };
                if buf[open] != buf[name] {
                    return Scan::Malformed {
                        resume: end,
                        reason: "mismatched close tag",
                    };
                }
                if stack.is_empty() {
                    return Scan::Complete {
                        end,
                        name: root.unwrap_or(start..start),
                    };
                }
                end
            }
            b if is_name_start(b) => {
                let name_start = i + 1;
                let mut j = name_start;
                while j < buf.len() && is_name_char(buf[j]) {
                    j += 1;
                }
                let name = name_start..j;
                match scan_open_tag(buf, j) {
                    TagEnd::Incomplete => return Scan::Incomplete,
                    TagEnd::Malformed { resume, reason } => {
                        return Scan::Malformed { resume, reason };
                    }
                    TagEnd::Open { end, self_closing } => {
                        if root.is_none() {
                            root = Some(name.clone());
                        }
                        if self_closing {
                            if stack.is_empty() {
                                return Scan::Complete { end, name };
                            }
                        } else {
                            stack.push(name);
                        }
                        end
                    }
                }
            }
            _ => {
                return Scan::Malformed {
                    resume: i + 1,
                    reason: "invalid tag name",
                };
            }
        };

        if stack.is_empty() {
            // Comment, declaration or processing instruction outside any element.
            return Scan::Skip { end: after };
        }

        // Character data up to the next markup.
        match buf[after..].iter().position(|&b| b == b'<') {
            Some(p) => i = after + p,
            None => return Scan::Incomplete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_end(input: &str) -> usize {
        match scan_fragment(input.as_bytes(), 0) {
            Scan::Complete { end, .. } => end,
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[test]
    fn test_simple_element() {
        assert_eq!(complete_end("<a>1</a>rest"), 8);
    }

    #[test]
    fn test_root_name_range() {
        let input = b"<reading id='1'><v/></reading>";
        match scan_fragment(input, 0) {
            Scan::Complete { name, .. } => assert_eq!(&input[name], b"reading"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_self_closing_root() {
        assert_eq!(complete_end("<ok/><next>"), 5);
        assert_eq!(complete_end("<ok a=\"1\" />"), 12);
    }

    #[test]
    fn test_quoted_gt_in_attribute() {
        assert_eq!(complete_end("<a b='x>y'>t</a>"), 16);
    }

    #[test]
    fn test_nested_same_name() {
        assert_eq!(complete_end("<a><a></a></a>"), 14);
    }

    #[test]
    fn test_comment_and_cdata_hide_markup() {
        assert_eq!(complete_end("<a><!-- </a> --></a>"), 20);
        assert_eq!(complete_end("<a><![CDATA[</a>]]></a>"), 23);
    }

    #[test]
    fn test_incomplete_inputs() {
        for input in ["<", "<a", "<a>", "<a>1</a", "<a b='", "<a><!-", "<a><![CDA", "<a>text"] {
            assert_eq!(
                scan_fragment(input.as_bytes(), 0),
                Scan::Incomplete,
                "input {input:?}"
            );
        }
    }

    #[test]
    fn test_mismatched_close_is_malformed() {
        let input = b"<a><b></a><c/>";
        match scan_fragment(input, 0) {
            Scan::Malformed { resume, .. } => assert_eq!(resume, 10),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_invalid_name_is_malformed() {
        assert!(matches!(
            scan_fragment(b"<3 apples", 0),
            Scan::Malformed { resume: 1, .. }
        ));
    }

    #[test]
    fn test_top_level_declaration_is_skipped() {
        assert_eq!(
            scan_fragment(b"<?xml version=\"1.0\"?><a/>", 0),
            Scan::Skip { end: 21 }
        );
        assert_eq!(scan_fragment(b"<!-- hi --><a/>", 0), Scan::Skip { end: 11 });
    }

    #[test]
    fn test_stray_close_tag() {
        assert!(matches!(
            scan_fragment(b"</b><a/>", 0),
            Scan::Malformed { resume: 4, .. }
        ));
    }
}

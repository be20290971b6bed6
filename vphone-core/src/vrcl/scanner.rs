//! Streaming tag scanner.
//!
//! VRCL has no length prefix: a message is one top-level XML element and
//! its boundaries are found by scanning. [`scan`] looks at the front of a
//! byte slice and reports what is there:
//!
//! ```text
//!   "  <IsAlive/>..."      -> Skip(2)
//!   "<IsAlive/>..."        -> Complete { unit, len: 10 }
//!   "<CallDial>555"        -> Incomplete          (wait for bytes)
//!   "</Orphan>..."         -> Invalid { skip: 9 } (flag, resync)
//! ```
//!
//! Partial input is never an error. Declarations (`<?...?>`), comments and
//! `<!...>` directives are skipped. Attribute values may contain `>` when
//! quoted, and an element may nest children with its own name.

/// One complete top-level element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagUnit {
    /// Element name, e.g. `CallDial`.
    pub name: String,
    /// The whole element, start tag through end tag.
    pub raw: String,
    /// Everything between the start and end tags; empty when self-closing.
    pub data: String,
}

/// Result of scanning the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scan {
    /// A complete element occupying the first `len` bytes.
    Complete { unit: TagUnit, len: usize },
    /// Bytes that carry no message (whitespace, declarations, comments).
    Skip(usize),
    /// The front of the buffer may become a message once more bytes arrive.
    Incomplete,
    /// The first `skip` bytes cannot start a message.
    Invalid { skip: usize },
}

pub fn scan(buf: &[u8]) -> Scan {
    match buf.iter().position(|&b| b == b'<') {
        None if buf.is_empty() => Scan::Incomplete,
        None => Scan::Skip(buf.len()),
        Some(0) => scan_markup(buf),
        Some(start) => Scan::Skip(start),
    }
}

// ── Internals ────────────────────────────────────────────────────

enum TagEnd {
    /// `>` found at this offset.
    Closed { gt: usize, self_closing: bool },
    Partial,
    /// An unquoted `<` appeared before the closing `>`.
    Stray(usize),
}

enum NameMatch {
    Yes(usize),
    No,
    Partial,
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b':') || b >= 0x80
}

fn scan_markup(buf: &[u8]) -> Scan {
    let Some(&second) = buf.get(1) else {
        return Scan::Incomplete;
    };
    match second {
        b'?' => skip_past(buf, 2, b"?>"),
        b'!' if buf.starts_with(b"<!--") => skip_past(buf, 4, b"-->"),
        b'!' if b"<!--".starts_with(buf) => Scan::Incomplete,
        b'!' => match find_tag_end(buf, 2) {
            TagEnd::Closed { gt, .. } => Scan::Skip(gt + 1),
            TagEnd::Partial => Scan::Incomplete,
            TagEnd::Stray(at) => Scan::Invalid { skip: at },
        },
        b'/' => match find_tag_end(buf, 2) {
            TagEnd::Closed { gt, .. } => Scan::Invalid { skip: gt + 1 },
            TagEnd::Partial => Scan::Incomplete,
            TagEnd::Stray(at) => Scan::Invalid { skip: at },
        },
        _ => scan_element(buf),
    }
}

fn skip_past(buf: &[u8], from: usize, terminator: &[u8]) -> Scan {
    match find(buf, from, terminator) {
        Some(pos) => Scan::Skip(pos + terminator.len()),
        None => Scan::Incomplete,
    }
}

fn find(buf: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Find the `>` closing a tag whose body starts at `from`, honouring quotes.
fn find_tag_end(buf: &[u8], from: usize) -> TagEnd {
    let mut quote: Option<u8> = None;
    for (i, &b) in buf.iter().enumerate().skip(from) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'<' => return TagEnd::Stray(i),
                b'>' => {
                    return TagEnd::Closed {
                        gt: i,
                        self_closing: i > 0 && buf[i - 1] == b'/',
                    };
                }
                _ => {}
            },
        }
    }
    TagEnd::Partial
}

fn match_name(buf: &[u8], at: usize, name: &[u8]) -> NameMatch {
    let avail = &buf[at.min(buf.len())..];
    if avail.len() <= name.len() {
        return if name.starts_with(avail) {
            NameMatch::Partial
        } else {
            NameMatch::No
        };
    }
    if &avail[..name.len()] == name && !is_name_byte(avail[name.len()]) {
        NameMatch::Yes(at + name.len())
    } else {
        NameMatch::No
    }
}

fn scan_element(buf: &[u8]) -> Scan {
    let Some(name_end) = buf[1..].iter().position(|&b| !is_name_byte(b)).map(|p| p + 1) else {
        return Scan::Incomplete;
    };
    if name_end == 1 {
        return Scan::Invalid { skip: 1 };
    }
    let delimiter = buf[name_end];
    if !(delimiter.is_ascii_whitespace() || delimiter == b'/' || delimiter == b'>') {
        return Scan::Invalid { skip: name_end };
    }
    let name = &buf[1..name_end];

    let open_end = match find_tag_end(buf, name_end) {
        TagEnd::Closed { gt, self_closing: true } => {
            return complete(buf, name, gt + 1, gt + 1, gt + 1);
        }
        TagEnd::Closed { gt, .. } => gt,
        TagEnd::Partial => return Scan::Incomplete,
        TagEnd::Stray(at) => return Scan::Invalid { skip: at },
    };

    let body_start = open_end + 1;
    let mut depth = 1usize;
    let mut i = body_start;
    loop {
        let Some(rel) = buf.get(i..).and_then(|rest| rest.iter().position(|&b| b == b'<')) else {
            return Scan::Incomplete;
        };
        let lt = i + rel;
        let rest = &buf[lt..];
        if rest.len() < 2 {
            return Scan::Incomplete;
        }

        if rest[1] == b'/' {
            match match_name(buf, lt + 2, name) {
                NameMatch::Partial => return Scan::Incomplete,
                NameMatch::No => i = lt + 1,
                NameMatch::Yes(after) => {
                    let Some(ws) = buf[after..].iter().position(|b| !b.is_ascii_whitespace()) else {
                        return Scan::Incomplete;
                    };
                    let gt = after + ws;
                    if buf[gt] != b'>' {
                        i = lt + 1;
                        continue;
                    }
                    depth -= 1;
                    if depth == 0 {
                        return complete(buf, name, body_start, lt, gt + 1);
                    }
                    i = gt + 1;
                }
            }
        } else if rest.starts_with(b"<!--") {
            match find(buf, lt + 4, b"-->") {
                Some(end) => i = end + 3,
                None => return Scan::Incomplete,
            }
        } else if b"<!--".starts_with(rest) {
            return Scan::Incomplete;
        } else {
            match match_name(buf, lt + 1, name) {
                NameMatch::Partial => return Scan::Incomplete,
                NameMatch::No => i = lt + 1,
                NameMatch::Yes(after) => match find_tag_end(buf, after) {
                    TagEnd::Closed { gt, self_closing } => {
                        if !self_closing {
                            depth += 1;
                        }
                        i = gt + 1;
                    }
                    TagEnd::Partial => return Scan::Incomplete,
                    TagEnd::Stray(at) => i = at,
                },
            }
        }
    }
}

fn complete(buf: &[u8], name: &[u8], data_start: usize, data_end: usize, len: usize) -> Scan {
    Scan::Complete {
        unit: TagUnit {
            name: String::from_utf8_lossy(name).into_owned(),
            raw: String::from_utf8_lossy(&buf[..len]).into_owned(),
            data: String::from_utf8_lossy(&buf[data_start..data_end]).into_owned(),
        },
        len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(input: &str) -> (TagUnit, usize) {
        match scan(input.as_bytes()) {
            Scan::Complete { unit, len } => (unit, len),
            other => panic!("expected a complete unit, got {other:?}"),
        }
    }

    #[test]
    fn self_closing_with_attributes() {
        let (u, len) = unit("<IsAlive /><Next/>");
        assert_eq!(u.name, "IsAlive");
        assert_eq!(u.raw, "<IsAlive />");
        assert_eq!(u.data, "");
        assert_eq!(len, 11);

        let (u, _) = unit(r#"<CallDial method="Direct" call='2'/>"#);
        assert_eq!(u.name, "CallDial");
    }

    #[test]
    fn element_with_text() {
        let (u, len) = unit("<Connect>abc123</Connect>tail");
        assert_eq!(u.name, "Connect");
        assert_eq!(u.data, "abc123");
        assert_eq!(len, "<Connect>abc123</Connect>".len());
    }

    #[test]
    fn quoted_gt_does_not_end_tag() {
        let (u, _) = unit(r#"<SettingSet name="a>b">1</SettingSet>"#);
        assert_eq!(u.data, "1");
        let (u, _) = unit(r#"<Note text='x/>'>y</Note>"#);
        assert_eq!(u.data, "y");
    }

    #[test]
    fn nested_same_name_elements() {
        let input = "<Item><Item>inner</Item><Item/></Item><After/>";
        let (u, len) = unit(input);
        assert_eq!(u.data, "<Item>inner</Item><Item/>");
        assert_eq!(&input[len..], "<After/>");
    }

    #[test]
    fn prefix_names_are_not_confused() {
        let (u, _) = unit("<Call><CallDial>1</CallDial></Call >");
        assert_eq!(u.name, "Call");
        assert_eq!(u.data, "<CallDial>1</CallDial>");
    }

    #[test]
    fn declarations_comments_and_garbage_are_skipped() {
        assert_eq!(scan(b"junk<IsAlive/>"), Scan::Skip(4));
        assert_eq!(scan(b"<?xml version=\"1.0\"?><A/>"), Scan::Skip(21));
        assert_eq!(scan(b"<!-- hi --><A/>"), Scan::Skip(11));
        assert_eq!(scan(b"<!DOCTYPE x><A/>"), Scan::Skip(12));
        assert_eq!(scan(b"\r\n"), Scan::Skip(2));
    }

    #[test]
    fn every_prefix_is_incomplete_or_skippable() {
        let msg = r#"<CallTransfer call="1">sip:bob@example.com</CallTransfer>"#;
        for cut in 0..msg.len() {
            let step = scan(&msg.as_bytes()[..cut]);
            assert_eq!(step, Scan::Incomplete, "prefix of {cut} bytes");
        }
        assert!(matches!(scan(msg.as_bytes()), Scan::Complete { .. }));
    }

    #[test]
    fn comment_inside_body_hides_end_tag() {
        let (u, _) = unit("<A>x<!-- </A> -->y</A>");
        assert_eq!(u.data, "x<!-- </A> -->y");
    }

    #[test]
    fn invalid_fragments_report_skip() {
        assert_eq!(scan(b"</Orphan><A/>"), Scan::Invalid { skip: 9 });
        assert_eq!(scan(b"< A/>"), Scan::Invalid { skip: 1 });
        assert_eq!(scan(b"<A<B/>"), Scan::Invalid { skip: 2 });
        assert_eq!(scan(b"<A x<B/>"), Scan::Invalid { skip: 4 });
    }
}

//! MIME tree parser and serializer.
//!
//! Parsing never fails. Anything that does not look like a multipart body is
//! kept as an opaque leaf, and every byte of the input that is not structure
//! (preamble, epilogue, leaf payloads, raw header values) is retained so an
//! untouched tree serializes back to the input.

use mail_parser::{MessageParser, MimeHeaders};

use super::codec;
use super::headers::{self, HeaderList};
use crate::error::MimeError;

/// Line terminator used when writing a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Crlf,
    Lf,
}

impl LineEnding {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Crlf => b"\r\n",
            Self::Lf => b"\n",
        }
    }

    fn from_bytes(eol: &[u8]) -> Self {
        if eol == b"\r\n" { Self::Crlf } else { Self::Lf }
    }
}

/// Body of a part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Payload bytes, still transfer-encoded.
    Leaf(Vec<u8>),
    Multipart(Multipart),
    /// `message/rfc822` with an identity transfer encoding.
    Message(Box<MimePart>),
}

/// Children of a multipart part plus the text around them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Multipart {
    pub boundary: String,
    pub preamble: Option<Vec<u8>>,
    pub parts: Vec<MimePart>,
    /// Bytes after `--boundary--`, including that line's terminator.
    pub epilogue: Vec<u8>,
    /// Whether the close delimiter was present.
    pub closed: bool,
}

/// One node of a MIME tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimePart {
    pub headers: HeaderList,
    pub body: Body,
    pub eol: LineEnding,
    /// Whether an empty line follows the headers.
    pub separator: bool,
    /// A multipart child with no bytes at all: its delimiter line break is
    /// also the one before the next delimiter.
    pub zero_length: bool,
}

impl MimePart {
    /// Parse a full message.
    pub fn parse(data: &[u8]) -> Self {
        Self::parse_with(data, LineEnding::Crlf)
    }

    fn parse_with(data: &[u8], fallback: LineEnding) -> Self {
        let block = headers::parse_block(data);
        let eol = block.eol.map(LineEnding::from_bytes).unwrap_or(fallback);
        let raw_body = &data[block.body_start..];
        let mut part = Self {
            headers: block.headers,
            body: Body::Leaf(Vec::new()),
            eol,
            separator: block.separator,
            zero_length: false,
        };
        part.body = part.parse_body(raw_body);
        part
    }

    fn parse_body(&self, raw: &[u8]) -> Body {
        let content_type = self.content_type();
        if content_type.starts_with("multipart/") {
            if let Some(boundary) = self.param("content-type", "boundary").filter(|b| !b.is_empty()) {
                if let Some(multipart) = parse_multipart(raw, &boundary, self.eol) {
                    return Body::Multipart(multipart);
                }
            }
        } else if content_type == "message/rfc822" && self.has_identity_encoding() {
            return Body::Message(Box::new(Self::parse_with(raw, self.eol)));
        }
        Body::Leaf(raw.to_vec())
    }

    /// A leaf with the given headers and already-encoded payload.
    pub fn leaf(headers: HeaderList, payload: Vec<u8>, eol: LineEnding) -> Self {
        Self {
            headers,
            body: Body::Leaf(payload),
            eol,
            separator: true,
            zero_length: false,
        }
    }

    fn empty_child(eol: LineEnding) -> Self {
        Self {
            headers: HeaderList::new(),
            body: Body::Leaf(Vec::new()),
            eol,
            separator: false,
            zero_length: true,
        }
    }

    /// Serialize the tree.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MimeError> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<(), MimeError> {
        let eol = self.eol.as_bytes();
        self.headers.write_to(out, eol)?;
        if self.separator {
            out.extend_from_slice(eol);
        }
        match &self.body {
            Body::Leaf(payload) => out.extend_from_slice(payload),
            Body::Message(inner) => inner.write_to(out)?,
            Body::Multipart(mp) => {
                if mp.boundary.is_empty() {
                    return Err(MimeError::Serialize {
                        reason: "multipart part without a boundary".into(),
                    });
                }
                let delimiter = format!("--{}", mp.boundary);
                if let Some(preamble) = &mp.preamble {
                    out.extend_from_slice(preamble);
                    out.extend_from_slice(eol);
                }
                for (i, child) in mp.parts.iter().enumerate() {
                    out.extend_from_slice(delimiter.as_bytes());
                    out.extend_from_slice(eol);
                    if child.zero_length {
                        continue;
                    }
                    child.write_to(out)?;
                    if mp.closed || i + 1 < mp.parts.len() {
                        out.extend_from_slice(eol);
                    }
                }
                if mp.closed {
                    out.extend_from_slice(delimiter.as_bytes());
                    out.extend_from_slice(b"--");
                    out.extend_from_slice(&mp.epilogue);
                }
            }
        }
        Ok(())
    }

    pub fn is_multipart(&self) -> bool {
        matches!(self.body, Body::Multipart(_) | Body::Message(_))
    }

    /// Lower-cased `type/subtype`, `text/plain` when absent or unparsable.
    pub fn content_type(&self) -> String {
        self.headers
            .get("content-type")
            .and_then(|v| {
                let mime = v.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
                mime.contains('/').then_some(mime)
            })
            .unwrap_or_else(|| "text/plain".to_string())
    }

    pub fn charset(&self) -> Option<String> {
        self.param("content-type", "charset")
    }

    /// Lower-cased transfer encoding.
    pub fn transfer_encoding(&self) -> Option<String> {
        self.headers
            .get("content-transfer-encoding")
            .map(|v| v.trim().to_ascii_lowercase())
    }

    fn has_identity_encoding(&self) -> bool {
        matches!(
            self.transfer_encoding().as_deref(),
            None | Some("7bit" | "8bit" | "binary")
        )
    }

    /// Whether `Content-Disposition` mentions `attachment`.
    pub fn is_attachment(&self) -> bool {
        self.headers
            .get("content-disposition")
            .is_some_and(|v| v.to_ascii_lowercase().contains("attachment"))
    }

    /// A parameter of a structured header, unquoted.
    pub fn param(&self, header: &str, name: &str) -> Option<String> {
        let value = self.headers.get(header)?;
        split_params(&value)
            .into_iter()
            .skip(1)
            .find_map(|p| {
                let (key, val) = p.split_once('=')?;
                key.trim().eq_ignore_ascii_case(name).then(|| unquote(val.trim()))
            })
    }

    /// Declared filename, with RFC 2047 and RFC 2231 forms decoded.
    pub fn filename(&self) -> Option<String> {
        let mut snippet = Vec::new();
        for header in self.headers.iter() {
            let name = header.name();
            if name.eq_ignore_ascii_case("content-type") || name.eq_ignore_ascii_case("content-disposition") {
                snippet.extend_from_slice(name.as_bytes());
                snippet.push(b':');
                snippet.extend_from_slice(header.raw_value());
                snippet.extend_from_slice(b"\r\n");
            }
        }
        if snippet.is_empty() {
            return None;
        }
        snippet.extend_from_slice(b"\r\n");

        let decoded = MessageParser::default().parse(&snippet).and_then(|msg| {
            msg.parts
                .first()
                .and_then(|p| p.attachment_name())
                .map(str::to_string)
        });
        decoded
            .or_else(|| self.param("content-disposition", "filename"))
            .or_else(|| self.param("content-type", "name"))
            .filter(|n| !n.trim().is_empty())
    }

    /// Leaf payload with the transfer encoding removed. Empty for containers.
    pub fn decoded_payload(&self) -> Vec<u8> {
        match &self.body {
            Body::Leaf(raw) => codec::decode_transfer(raw, self.transfer_encoding().as_deref()),
            _ => Vec::new(),
        }
    }

    /// Replace the payload, encoding it with the part's current transfer encoding.
    pub fn set_decoded_payload(&mut self, data: &[u8]) {
        let encoded = codec::encode_transfer(data, self.transfer_encoding().as_deref(), self.eol.as_bytes());
        self.body = Body::Leaf(encoded);
        self.separator = true;
        self.zero_length = false;
    }

    /// Depth-first iterator over this part and every descendant.
    pub fn walk(&self) -> Vec<&MimePart> {
        let mut out = vec![self];
        match &self.body {
            Body::Multipart(mp) => {
                for child in &mp.parts {
                    out.extend(child.walk());
                }
            }
            Body::Message(inner) => out.extend(inner.walk()),
            Body::Leaf(_) => {}
        }
        out
    }
}

fn parse_multipart(body: &[u8], boundary: &str, eol: LineEnding) -> Option<Multipart> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    // (line start, line end, is close delimiter)
    let mut marks: Vec<(usize, usize, bool)> = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        let (content_end, next) = headers::line_bounds(body, pos);
        let line = &body[pos..content_end];
        if let Some(rest) = line.strip_prefix(delimiter) {
            let rest = trim_trailing_ws(rest);
            if rest.is_empty() {
                marks.push((pos, next, false));
            } else if rest == b"--" {
                marks.push((pos, next, true));
                break;
            }
        }
        pos = next;
    }

    let first = marks.first()?;
    let preamble = (first.0 > 0).then(|| body[..first.0 - term_len_before(body, first.0)].to_vec());

    let mut parts = Vec::new();
    for (i, &(_, line_end, is_close)) in marks.iter().enumerate() {
        if is_close {
            break;
        }
        let end = match marks.get(i + 1) {
            Some(&(start, _, _)) => start - term_len_before(body, start),
            None => body.len(),
        };
        if end < line_end {
            parts.push(MimePart::empty_child(eol));
        } else {
            parts.push(MimePart::parse_with(&body[line_end..end], eol));
        }
    }

    let (closed, epilogue) = match marks.last() {
        Some(&(start, _, true)) => (true, body[start + delimiter.len() + 2..].to_vec()),
        _ => (false, Vec::new()),
    };

    Some(Multipart {
        boundary: boundary.to_string(),
        preamble,
        parts,
        epilogue,
        closed,
    })
}

fn term_len_before(data: &[u8], pos: usize) -> usize {
    if pos >= 2 && &data[pos - 2..pos] == b"\r\n" {
        2
    } else if pos >= 1 && data[pos - 1] == b'\n' {
        1
    } else {
        0
    }
}

fn trim_trailing_ws(mut s: &[u8]) -> &[u8] {
    while let [rest @ .., b' ' | b'\t'] = s {
        s = rest;
    }
    s
}

/// Split a structured header value on `;`, ignoring separators inside quotes.
fn split_params(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for c in value.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ';' if !in_quotes => out.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    out.push(current);
    out
}

fn unquote(value: &str) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => {
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else {
                    out.push(c);
                }
            }
            out
        }
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTIPART: &[u8] = b"From: a@example.com\r\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
\r\n\
This is a preamble.\r\n\
--XYZ\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
hello\r\n\
--XYZ\r\n\
Content-Type: application/octet-stream\r\n\
Content-Transfer-Encoding: base64\r\n\
Content-Disposition: attachment; filename=\"data.bin\"\r\n\
\r\n\
AAECAw==\r\n\
--XYZ--\r\n\
epilogue\r\n";

    #[test]
    fn multipart_round_trips_byte_for_byte() {
        let part = MimePart::parse(MULTIPART);
        let Body::Multipart(mp) = &part.body else {
            panic!("expected multipart");
        };
        assert_eq!(mp.parts.len(), 2);
        assert_eq!(mp.preamble.as_deref(), Some(&b"This is a preamble."[..]));
        assert_eq!(mp.epilogue, b"\r\nepilogue\r\n");
        assert_eq!(part.to_bytes().unwrap(), MULTIPART);
    }

    #[test]
    fn leaf_accessors() {
        let part = MimePart::parse(MULTIPART);
        let leaves = part.walk();
        assert_eq!(leaves.len(), 3);
        let text = leaves[1];
        assert_eq!(text.content_type(), "text/plain");
        assert_eq!(text.charset().as_deref(), Some("utf-8"));
        assert_eq!(text.decoded_payload(), b"hello");

        let bin = leaves[2];
        assert!(bin.is_attachment());
        assert_eq!(bin.filename().as_deref(), Some("data.bin"));
        assert_eq!(bin.decoded_payload(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn simple_message_round_trips_with_lf() {
        let raw = b"Subject: hi\nFrom: a@example.com\n\nline one\nline two\n";
        let part = MimePart::parse(raw);
        assert_eq!(part.eol, LineEnding::Lf);
        assert_eq!(part.to_bytes().unwrap(), raw);
    }

    #[test]
    fn unterminated_multipart_round_trips() {
        let raw = b"Content-Type: multipart/alternative; boundary=b\n\n--b\n\nfirst\n--b\nContent-Type: text/html\n\n<p>x</p>";
        let part = MimePart::parse(raw);
        let Body::Multipart(mp) = &part.body else {
            panic!("expected multipart");
        };
        assert!(!mp.closed);
        assert_eq!(mp.parts.len(), 2);
        assert_eq!(part.to_bytes().unwrap(), raw);
    }

    #[test]
    fn headers_without_blank_line_round_trip() {
        let part = MimePart::parse(b"Subject: hi\r\n");
        assert!(!part.separator);
        assert_eq!(part.headers.get("subject").unwrap(), "hi");
        assert_eq!(part.to_bytes().unwrap(), b"Subject: hi\r\n");

        assert_eq!(MimePart::parse(b"").to_bytes().unwrap(), b"");
    }

    #[test]
    fn adjacent_delimiters_keep_an_empty_part() {
        let raw = b"Content-Type: multipart/mixed; boundary=b\n\n--b\n--b\nContent-Type: text/plain\n\nx\n--b--\n";
        let part = MimePart::parse(raw);
        let Body::Multipart(mp) = &part.body else {
            panic!("expected multipart");
        };
        assert_eq!(mp.parts.len(), 2);
        assert!(mp.parts[0].zero_length);
        assert_eq!(mp.parts[1].decoded_payload(), b"x");
        assert_eq!(part.to_bytes().unwrap(), raw);

        let blank = b"Content-Type: multipart/mixed; boundary=b\n\n--b\n\n--b--\n";
        let part = MimePart::parse(blank);
        let Body::Multipart(mp) = &part.body else {
            panic!("expected multipart");
        };
        assert!(!mp.parts[0].zero_length);
        assert_eq!(part.to_bytes().unwrap(), blank);
    }

    #[test]
    fn replaced_payload_gets_a_separator() {
        let mut part = MimePart::parse(b"Content-Type: text/plain\n");
        part.set_decoded_payload(b"body");
        assert_eq!(part.to_bytes().unwrap(), b"Content-Type: text/plain\n\nbody");
    }

    #[test]
    fn multipart_without_delimiters_stays_a_leaf() {
        let raw = b"Content-Type: multipart/mixed; boundary=nope\r\n\r\njust text\r\n";
        let part = MimePart::parse(raw);
        assert!(matches!(part.body, Body::Leaf(_)));
        assert_eq!(part.to_bytes().unwrap(), raw);
    }

    #[test]
    fn embedded_message_is_parsed() {
        let raw = b"Content-Type: message/rfc822\r\n\r\nSubject: inner\r\n\r\ninner body\r\n";
        let part = MimePart::parse(raw);
        let Body::Message(inner) = &part.body else {
            panic!("expected embedded message");
        };
        assert_eq!(inner.headers.get("subject").unwrap(), "inner");
        assert_eq!(part.to_bytes().unwrap(), raw);
    }

    #[test]
    fn encoded_word_filename_is_decoded() {
        let raw = b"Content-Type: application/pdf\r\nContent-Disposition: attachment;\r\n filename=\"=?utf-8?q?r=C3=A9sum=C3=A9.pdf?=\"\r\n\r\n";
        let part = MimePart::parse(raw);
        assert_eq!(part.filename().as_deref(), Some("résumé.pdf"));
    }

    #[test]
    fn params_respect_quotes() {
        let raw = b"Content-Type: text/plain; name=\"a;b.txt\"; charset=\"ISO-8859-1\"\r\n\r\n";
        let part = MimePart::parse(raw);
        assert_eq!(part.param("content-type", "name").as_deref(), Some("a;b.txt"));
        assert_eq!(part.charset().as_deref(), Some("ISO-8859-1"));
    }
}

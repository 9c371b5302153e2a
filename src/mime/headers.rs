//! Ordered, non-unique MIME header list.
//!
//! Values are kept as the raw bytes that followed the colon (folds included)
//! so a parsed block serializes back byte for byte.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::error::MimeError;

/// Marks a header blob holding base64 bytes. A leading colon never starts a
/// header line.
pub const BASE64_BLOB: &str = ":base64:";

/// One header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    name: String,
    raw_value: Vec<u8>,
}

impl Header {
    /// A header with a single leading space before the value, the way new
    /// headers are conventionally written.
    pub fn new(name: impl Into<String>, value: &str) -> Self {
        let mut raw_value = Vec::with_capacity(value.len() + 1);
        raw_value.push(b' ');
        raw_value.extend_from_slice(value.as_bytes());
        Self {
            name: name.into(),
            raw_value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raw_value(&self) -> &[u8] {
        &self.raw_value
    }

    /// Unfolded, trimmed value. Non-UTF-8 bytes are read as Latin-1.
    pub fn value(&self) -> String {
        let text = bytes_to_string(&self.raw_value, None);
        unfold(&text)
    }

    /// Like [`Header::value`], decoding 8-bit bytes with `charset` when they
    /// are not valid UTF-8.
    pub fn value_with_charset(&self, charset: &str) -> String {
        let text = bytes_to_string(&self.raw_value, Some(charset));
        unfold(&text)
    }

    fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Header block of one MIME part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    headers: Vec<Header>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.headers.iter()
    }

    /// `(name, value)` pairs in order.
    pub fn items(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|h| (h.name.clone(), h.value()))
            .collect()
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<String> {
        self.header(name).map(Header::value)
    }

    pub fn header(&self, name: &str) -> Option<&Header> {
        self.headers.iter().find(|h| h.matches(name))
    }

    pub fn get_all(&self, name: &str) -> Vec<String> {
        self.headers
            .iter()
            .filter(|h| h.matches(name))
            .map(Header::value)
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Append a header; existing headers with the same name are kept.
    pub fn append(&mut self, name: impl Into<String>, value: &str) {
        self.headers.push(Header::new(name, value));
    }

    pub fn push(&mut self, header: Header) {
        self.headers.push(header);
    }

    /// Set `name` to `value` at the position of its first occurrence,
    /// dropping any later duplicates. Appends when absent.
    pub fn replace(&mut self, name: &str, value: &str) {
        match self.headers.iter().position(|h| h.matches(name)) {
            Some(pos) => {
                let existing = self.headers[pos].name.clone();
                self.headers[pos] = Header::new(existing, value);
                let mut idx = 0;
                self.headers.retain(|h| {
                    let keep = idx <= pos || !h.matches(name);
                    idx += 1;
                    keep
                });
            }
            None => self.append(name, value),
        }
    }

    /// Remove every header called `name`. Returns how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.headers.len();
        self.headers.retain(|h| !h.matches(name));
        before - self.headers.len()
    }

    /// Write the block, each header terminated by `eol`. The blank separator
    /// line is not written.
    pub fn write_to(&self, out: &mut Vec<u8>, eol: &[u8]) -> Result<(), MimeError> {
        for header in &self.headers {
            check_name(&header.name)?;
            check_value(&header.name, &header.raw_value)?;
            out.extend_from_slice(header.name.as_bytes());
            out.push(b':');
            out.extend_from_slice(&header.raw_value);
            out.extend_from_slice(eol);
        }
        Ok(())
    }

    /// Serialized form kept next to an offloaded attachment. Blocks that are
    /// not valid UTF-8 are stored base64-encoded behind [`BASE64_BLOB`].
    pub fn to_blob(&self) -> Result<String, MimeError> {
        let mut out = Vec::new();
        self.write_to(&mut out, b"\n")?;
        Ok(match String::from_utf8(out) {
            Ok(text) => text,
            Err(e) => format!("{BASE64_BLOB}{}", STANDARD.encode(e.as_bytes())),
        })
    }

    /// Inverse of [`HeaderList::to_blob`]. Every line must be a header or a
    /// continuation.
    pub fn from_blob(blob: &str) -> Result<Self, MimeError> {
        let bytes = match blob.strip_prefix(BASE64_BLOB) {
            Some(encoded) => STANDARD
                .decode(encoded.trim())
                .map_err(|e| MimeError::MalformedHeader(format!("header blob: {e}")))?,
            None => blob.as_bytes().to_vec(),
        };
        let parsed = parse_block(&bytes);
        let rest = &bytes[parsed.body_start..];
        if let Some(bad) = rest
            .split(|b| *b == b'\n')
            .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
            .find(|l| !l.is_empty())
        {
            return Err(MimeError::MalformedHeader(
                String::from_utf8_lossy(bad).into_owned(),
            ));
        }
        Ok(parsed.headers)
    }
}

/// Result of scanning a header block.
pub(crate) struct ParsedBlock {
    pub headers: HeaderList,
    /// Offset of the first body byte.
    pub body_start: usize,
    /// Terminator of the first line, if any line was terminated.
    pub eol: Option<&'static [u8]>,
    /// Whether the block ended on an empty line.
    pub separator: bool,
}

/// Split a header block off the front of `data`.
///
/// The block ends at the first empty line (consumed) or at the first line
/// that is neither a header nor a continuation (not consumed).
pub(crate) fn parse_block(data: &[u8]) -> ParsedBlock {
    let mut headers = Vec::<Header>::new();
    let mut eol = None;
    let mut pos = 0;
    // Pending terminator of the last header line, prepended if a
    // continuation follows.
    let mut pending_term: &[u8] = b"";

    while pos < data.len() {
        let (content_end, next) = line_bounds(data, pos);
        let line = &data[pos..content_end];
        let term = &data[content_end..next];
        if eol.is_none() && !term.is_empty() {
            eol = Some(if term.len() == 2 {
                b"\r\n" as &'static [u8]
            } else {
                b"\n"
            });
        }

        if line.is_empty() {
            return ParsedBlock {
                headers: HeaderList { headers },
                body_start: next,
                eol,
                separator: true,
            };
        }

        if matches!(line[0], b' ' | b'\t') {
            if let Some(last) = headers.last_mut() {
                last.raw_value.extend_from_slice(pending_term);
                last.raw_value.extend_from_slice(line);
                pending_term = term;
                pos = next;
                continue;
            }
            break;
        }

        match line.iter().position(|b| *b == b':') {
            Some(colon) if colon > 0 && is_valid_name(&line[..colon]) => {
                headers.push(Header {
                    name: String::from_utf8_lossy(&line[..colon]).into_owned(),
                    raw_value: line[colon + 1..].to_vec(),
                });
                pending_term = term;
                pos = next;
            }
            _ => break,
        }
    }

    ParsedBlock {
        headers: HeaderList { headers },
        body_start: pos,
        eol,
        separator: false,
    }
}

/// `(end of line content, start of next line)` for the line beginning at `pos`.
pub(crate) fn line_bounds(data: &[u8], pos: usize) -> (usize, usize) {
    match data[pos..].iter().position(|b| *b == b'\n') {
        Some(i) => {
            let nl = pos + i;
            let content_end = if nl > pos && data[nl - 1] == b'\r' {
                nl - 1
            } else {
                nl
            };
            (content_end, nl + 1)
        }
        None => (data.len(), data.len()),
    }
}

/// Decode header bytes: UTF-8 when valid, otherwise `charset` (Latin-1 if
/// unknown or absent).
pub(crate) fn bytes_to_string(raw: &[u8], charset: Option<&str>) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let encoding = charset
                .and_then(|c| encoding_rs::Encoding::for_label(c.as_bytes()))
                .unwrap_or(encoding_rs::WINDOWS_1252);
            let (text, _, _) = encoding.decode(raw);
            text.into_owned()
        }
    }
}

fn unfold(text: &str) -> String {
    text.replace("\r\n", "\n")
        .split('\n')
        .collect::<String>()
        .trim()
        .to_string()
}

fn is_valid_name(name: &[u8]) -> bool {
    !name.is_empty() && name.iter().all(|b| (33..=126).contains(b) && *b != b':')
}

fn check_name(name: &str) -> Result<(), MimeError> {
    if is_valid_name(name.as_bytes()) {
        Ok(())
    } else {
        Err(MimeError::Serialize {
            reason: format!("invalid header name {name:?}"),
        })
    }
}

/// A line break inside a value must start a continuation line.
fn check_value(name: &str, raw: &[u8]) -> Result<(), MimeError> {
    for (i, b) in raw.iter().enumerate() {
        let breaks = *b == b'\n' || (*b == b'\r' && raw.get(i + 1) != Some(&b'\n'));
        if breaks && !matches!(raw.get(i + 1), Some(b' ' | b'\t')) {
            return Err(MimeError::Serialize {
                reason: format!("header {name} contains a bare line break"),
            });
        }
    }
    Ok(())
}

//! Transfer-encoding and charset codecs.
//!
//! Decoders are lenient and never fail: mail in the wild is full of
//! truncated base64 and stray `=` signs.

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};

const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

const LINE_LEN: usize = 76;

/// Decode a base64 body, ignoring whitespace and anything outside the alphabet.
pub fn base64_decode(data: &[u8]) -> Vec<u8> {
    let mut clean: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/')
        .collect();
    if clean.len() % 4 == 1 {
        clean.pop();
    }
    LENIENT.decode(&clean).unwrap_or_default()
}

/// Base64 in 76-column lines, each terminated by `eol`.
pub fn base64_encode(data: &[u8], eol: &[u8]) -> Vec<u8> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(data);
    let mut out = Vec::with_capacity(encoded.len() + encoded.len() / LINE_LEN * eol.len() + eol.len());
    for chunk in encoded.as_bytes().chunks(LINE_LEN) {
        out.extend_from_slice(chunk);
        out.extend_from_slice(eol);
    }
    out
}

/// Decode quoted-printable. Soft breaks are removed; hard line breaks are
/// kept as they appear.
pub fn qp_decode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        if b != b'=' {
            out.push(b);
            i += 1;
            continue;
        }
        match (data.get(i + 1), data.get(i + 2)) {
            (Some(b'\r'), Some(b'\n')) => i += 3,
            (Some(b'\n'), _) => i += 2,
            (Some(h), Some(l)) => match (hex_val(*h), hex_val(*l)) {
                (Some(h), Some(l)) => {
                    out.push(h << 4 | l);
                    i += 3;
                }
                _ => {
                    out.push(b'=');
                    i += 1;
                }
            },
            _ => {
                out.push(b'=');
                i += 1;
            }
        }
    }
    out
}

/// Encode quoted-printable with every space and tab escaped, so no line can
/// end in whitespace. Only line breaks matching `eol` stay literal; any other
/// CR or LF byte is escaped, which makes [`qp_decode`] exact.
pub fn qp_encode(data: &[u8], eol: &[u8]) -> Vec<u8> {
    let crlf = eol == b"\r\n";
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut col = 0usize;
    let mut i = 0;

    while i < data.len() {
        let b = data[i];
        let hard_break = if crlf {
            b == b'\r' && data.get(i + 1) == Some(&b'\n')
        } else {
            b == b'\n'
        };
        if hard_break {
            out.extend_from_slice(eol);
            col = 0;
            i += eol.len();
            continue;
        }

        let literal = (33..=126).contains(&b) && b != b'=';
        let width = if literal { 1 } else { 3 };
        // Room for the token plus a trailing soft-break `=`.
        if col + width > LINE_LEN - 1 {
            out.push(b'=');
            out.extend_from_slice(eol);
            col = 0;
        }
        if literal {
            out.push(b);
        } else {
            out.push(b'=');
            out.push(HEX[(b >> 4) as usize]);
            out.push(HEX[(b & 0x0f) as usize]);
        }
        col += width;
        i += 1;
    }
    out
}

const HEX: &[u8; 16] = b"0123456789ABCDEF";

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

/// Undo a `Content-Transfer-Encoding`. Unknown encodings pass through.
pub fn decode_transfer(data: &[u8], encoding: Option<&str>) -> Vec<u8> {
    match encoding.map(str::to_ascii_lowercase).as_deref() {
        Some("base64") => base64_decode(data),
        Some("quoted-printable") => qp_decode(data),
        _ => data.to_vec(),
    }
}

/// Apply a `Content-Transfer-Encoding`; identity encodings pass through.
pub fn encode_transfer(data: &[u8], encoding: Option<&str>, eol: &[u8]) -> Vec<u8> {
    match encoding.map(str::to_ascii_lowercase).as_deref() {
        Some("base64") => base64_encode(data, eol),
        Some("quoted-printable") => qp_encode(data, eol),
        _ => data.to_vec(),
    }
}

/// Outcome of decoding text in a declared charset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Exact(String),
    /// The charset was unknown or the bytes invalid; non-ASCII bytes were
    /// replaced with U+FFFD.
    Lossy { text: String, reason: String },
}

impl Decoded {
    pub fn into_text(self) -> String {
        match self {
            Self::Exact(text) | Self::Lossy { text, .. } => text,
        }
    }

    pub fn is_lossy(&self) -> bool {
        matches!(self, Self::Lossy { .. })
    }
}

/// Decode `data` as `charset` (US-ASCII when absent).
pub fn decode_charset(data: &[u8], charset: Option<&str>) -> Decoded {
    let label = charset.unwrap_or("us-ascii").trim();
    if is_ascii_label(label) {
        return match std::str::from_utf8(data) {
            Ok(text) if data.is_ascii() => Decoded::Exact(text.to_string()),
            _ => lossy_ascii(data, format!("invalid bytes for {label}")),
        };
    }
    let Some(encoding) = encoding_rs::Encoding::for_label(label.as_bytes()) else {
        return lossy_ascii(data, format!("unknown charset {label}"));
    };
    match encoding.decode_without_bom_handling_and_without_replacement(data) {
        Some(text) => Decoded::Exact(text.into_owned()),
        None => lossy_ascii(data, format!("invalid bytes for {label}")),
    }
}

fn is_ascii_label(label: &str) -> bool {
    ["us-ascii", "ascii", "ansi_x3.4-1968", "646"]
        .iter()
        .any(|l| l.eq_ignore_ascii_case(label))
}

fn lossy_ascii(data: &[u8], reason: String) -> Decoded {
    let text = data
        .iter()
        .map(|b| if b.is_ascii() { *b as char } else { char::REPLACEMENT_CHARACTER })
        .collect();
    Decoded::Lossy { text, reason }
}

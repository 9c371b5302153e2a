//! MIME handling: parsing, codecs, and the dehydrate/rehydrate transforms.

pub mod codec;
pub mod dehydrate;
pub mod headers;
pub mod part;
pub mod rehydrate;

pub use dehydrate::{Dehydrated, PendingAttachment, dehydrate};
pub use headers::{Header, HeaderList};
pub use part::{Body, LineEnding, MimePart, Multipart};
pub use rehydrate::{AttachmentContent, placeholder_ids, rehydrate};

use mail_parser::MessageParser;
use tracing::warn;

/// Concatenated, charset-decoded text of every leaf of `content_type`.
/// Undecodable text is replaced rather than reported.
pub fn body_text(message: &MimePart, content_type: &str) -> String {
    let mut out = String::new();
    for part in message.walk() {
        if part.is_multipart() || part.content_type() != content_type {
            continue;
        }
        let charset = part.charset();
        let decoded = codec::decode_charset(&part.decoded_payload(), charset.as_deref());
        if let codec::Decoded::Lossy { reason, .. } = &decoded {
            warn!(reason = %reason, "Lossy decode while extracting body text");
        }
        out.push_str(&decoded.into_text());
    }
    out
}

/// Decode RFC 2047 encoded words in an unstructured header value.
pub fn decode_header_value(raw: &str) -> String {
    let mut snippet = Vec::with_capacity(raw.len() + 16);
    snippet.extend_from_slice(b"Subject: ");
    snippet.extend_from_slice(raw.trim().as_bytes());
    snippet.extend_from_slice(b"\r\n\r\n");
    MessageParser::default()
        .parse(&snippet)
        .and_then(|m| m.subject().map(str::to_string))
        .unwrap_or_else(|| raw.trim().to_string())
}

/// Lower-cased addresses from an address-list header value.
pub fn parse_addresses(raw: &str) -> Vec<String> {
    let mut snippet = Vec::with_capacity(raw.len() + 16);
    snippet.extend_from_slice(b"To: ");
    snippet.extend_from_slice(raw.trim().as_bytes());
    snippet.extend_from_slice(b"\r\n\r\n");
    let Some(parsed) = MessageParser::default().parse(&snippet) else {
        return Vec::new();
    };
    match parsed.to() {
        Some(mail_parser::Address::List(addrs)) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_lowercase()))
            .collect(),
        Some(mail_parser::Address::Group(groups)) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_lowercase()))
            })
            .collect(),
        None => Vec::new(),
    }
}

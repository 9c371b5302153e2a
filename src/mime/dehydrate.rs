//! Turn an incoming message into its storage-safe form.
//!
//! Binary parts are lifted out into [`PendingAttachment`]s and replaced by a
//! placeholder carrying only the interpolation header. Persisting the
//! attachments is the caller's job; this module performs no I/O.

use std::path::Path;

use tracing::warn;
use uuid::Uuid;

use super::codec;
use super::headers::HeaderList;
use super::part::{Body, MimePart, Multipart};
use crate::config::GatewayConfig;
use crate::error::MimeError;

/// An attachment removed from the tree, waiting to be stored.
#[derive(Debug, Clone)]
pub struct PendingAttachment {
    /// Referenced by the placeholder's interpolation header.
    pub id: Uuid,
    /// Storage name: random hex plus an extension.
    pub stored_name: String,
    /// Decoded filename from the part, if it declared one.
    pub original_filename: Option<String>,
    /// The part's original headers.
    pub headers: HeaderList,
    /// Decoded payload bytes.
    pub payload: Vec<u8>,
}

/// Output of [`dehydrate`].
#[derive(Debug, Clone)]
pub struct Dehydrated {
    pub message: MimePart,
    /// `message` serialized.
    pub serialized: Vec<u8>,
    pub attachments: Vec<PendingAttachment>,
}

/// Dehydrate a raw message. Fails only when the transformed tree cannot be
/// serialized, in which case nothing about the message should be stored.
pub fn dehydrate(raw: &[u8], config: &GatewayConfig) -> Result<Dehydrated, MimeError> {
    let original = MimePart::parse(raw);
    let mut attachments = Vec::new();
    let message = dehydrate_part(&original, config, &mut attachments);
    let serialized = message.to_bytes()?;
    Ok(Dehydrated {
        message,
        serialized,
        attachments,
    })
}

/// Dehydrate one part (recursively), pushing lifted attachments onto `out`.
pub fn dehydrate_part(part: &MimePart, config: &GatewayConfig, out: &mut Vec<PendingAttachment>) -> MimePart {
    match &part.body {
        Body::Multipart(mp) => {
            let parts = mp.parts.iter().map(|p| dehydrate_part(p, config, out)).collect();
            return MimePart {
                headers: part.headers.clone(),
                body: Body::Multipart(Multipart {
                    parts,
                    ..mp.clone_shell()
                }),
                eol: part.eol,
                separator: part.separator,
                zero_length: part.zero_length,
            };
        }
        Body::Message(inner) => {
            return MimePart {
                headers: part.headers.clone(),
                body: Body::Message(Box::new(dehydrate_part(inner, config, out))),
                eol: part.eol,
                separator: part.separator,
                zero_length: part.zero_length,
            };
        }
        Body::Leaf(_) => {}
    }

    let content_type = part.content_type();

    if config.strip_unallowed_mimetypes && !config.is_allowed(&content_type) {
        return strip(part, &content_type, config);
    }

    if !config.is_text_stored(&content_type) || part.is_attachment() {
        let pending = lift_attachment(part, &content_type);
        let mut headers = HeaderList::new();
        headers.append(config.attachment_interpolation_header.clone(), &pending.id.to_string());
        out.push(pending);
        return MimePart::leaf(headers, Vec::new(), part.eol);
    }

    verify_charset(part)
}

impl Multipart {
    /// Everything except the children.
    fn clone_shell(&self) -> Self {
        Self {
            boundary: self.boundary.clone(),
            preamble: self.preamble.clone(),
            parts: Vec::new(),
            epilogue: self.epilogue.clone(),
            closed: self.closed,
        }
    }
}

fn strip(part: &MimePart, content_type: &str, config: &GatewayConfig) -> MimePart {
    if part.headers.contains(&config.altered_message_header) {
        return part.clone();
    }
    let mut headers = part.headers.clone();
    headers.remove("Content-Transfer-Encoding");
    headers.append(
        config.altered_message_header.clone(),
        &format!("Stripped; Content type {content_type} not allowed"),
    );
    MimePart::leaf(headers, Vec::new(), part.eol)
}

fn lift_attachment(part: &MimePart, content_type: &str) -> PendingAttachment {
    let original_filename = part.filename();
    let extension = original_filename
        .as_deref()
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .or_else(|| {
            mime_guess::get_mime_extensions_str(content_type)
                .and_then(|exts| exts.first())
                .map(|ext| format!(".{ext}"))
        })
        .unwrap_or_else(|| ".bin".to_string());

    let id = Uuid::new_v4();
    PendingAttachment {
        id,
        stored_name: format!("{}{}", id.simple(), extension),
        original_filename,
        headers: part.headers.clone(),
        payload: part.decoded_payload(),
    }
}

/// Keep an inline text part, replacing its payload with lossy ASCII when the
/// declared charset cannot decode it.
fn verify_charset(part: &MimePart) -> MimePart {
    let charset = part.charset();
    let payload = part.decoded_payload();
    match codec::decode_charset(&payload, charset.as_deref()) {
        codec::Decoded::Exact(_) => part.clone(),
        codec::Decoded::Lossy { text, reason } => {
            warn!(
                charset = charset.as_deref().unwrap_or("us-ascii"),
                reason = %reason,
                "Falling back to lossy ASCII for inline text part"
            );
            let mut replaced = part.clone();
            replaced.set_decoded_payload(text.as_bytes());
            replaced
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GatewayConfig {
        GatewayConfig::default()
    }

    const WITH_IMAGE: &[u8] = b"Subject: photo\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain; charset=us-ascii\r\n\
\r\n\
see attached\r\n\
--b1\r\n\
Content-Type: image/png\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
iVBORw0KGgo=\r\n\
--b1--\r\n";

    #[test]
    fn text_only_message_is_unchanged() {
        let raw = b"Subject: hi\r\nContent-Type: text/plain\r\n\r\nplain body\r\n";
        let out = dehydrate(raw, &config()).unwrap();
        assert!(out.attachments.is_empty());
        assert_eq!(out.serialized, raw);
    }

    #[test]
    fn binary_part_becomes_placeholder() {
        let cfg = config();
        let out = dehydrate(WITH_IMAGE, &cfg).unwrap();
        assert_eq!(out.attachments.len(), 1);

        let att = &out.attachments[0];
        assert!(att.stored_name.ends_with(".png"));
        assert_eq!(att.payload, b"\x89PNG\r\n\x1a\n");
        assert_eq!(att.headers.get("content-type").unwrap(), "image/png");

        let leaves = out.message.walk();
        let placeholder = leaves[2];
        assert_eq!(placeholder.headers.len(), 1);
        assert_eq!(
            placeholder.headers.get(&cfg.attachment_interpolation_header).unwrap(),
            att.id.to_string()
        );
        assert!(placeholder.decoded_payload().is_empty());
    }

    #[test]
    fn declared_attachment_is_lifted_even_when_text() {
        let raw = b"Content-Type: multipart/mixed; boundary=z\n\n--z\nContent-Type: text/plain\nContent-Disposition: attachment; filename=\"notes.txt\"\n\nnotes\n--z--\n";
        let out = dehydrate(raw, &config()).unwrap();
        assert_eq!(out.attachments.len(), 1);
        assert_eq!(out.attachments[0].original_filename.as_deref(), Some("notes.txt"));
        assert!(out.attachments[0].stored_name.ends_with(".txt"));
    }

    #[test]
    fn unknown_type_without_filename_gets_bin_extension() {
        let raw = b"Content-Type: application/x-made-up\r\n\r\nxyz";
        let out = dehydrate(raw, &config()).unwrap();
        assert!(out.attachments[0].stored_name.ends_with(".bin"));
        assert_eq!(out.attachments[0].payload, b"xyz");
    }

    #[test]
    fn stripping_replaces_payload_and_is_idempotent() {
        let cfg = GatewayConfig {
            strip_unallowed_mimetypes: true,
            ..config()
        };
        let once = dehydrate(WITH_IMAGE, &cfg).unwrap();
        assert!(once.attachments.is_empty());

        let stripped = once.message.walk()[2].clone();
        assert!(!stripped.headers.contains("content-transfer-encoding"));
        assert_eq!(
            stripped.headers.get(&cfg.altered_message_header).unwrap(),
            "Stripped; Content type image/png not allowed"
        );
        assert!(stripped.decoded_payload().is_empty());

        let twice = dehydrate(&once.serialized, &cfg).unwrap();
        assert_eq!(twice.serialized, once.serialized);
    }

    #[test]
    fn unknown_charset_is_replaced_not_raised() {
        let raw = b"Content-Type: text/plain; charset=x-klingon\r\n\r\ncaf\xe9";
        let out = dehydrate(raw, &config()).unwrap();
        assert_eq!(out.message.decoded_payload(), "caf\u{FFFD}".as_bytes());
    }

    #[test]
    fn unserializable_tree_is_reported() {
        let cfg = GatewayConfig {
            attachment_interpolation_header: "Bad Header".into(),
            ..config()
        };
        assert!(dehydrate(WITH_IMAGE, &cfg).is_err());
    }
}

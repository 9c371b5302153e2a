//! Rebuild a full MIME tree from its dehydrated form.

use std::collections::HashMap;

use tracing::warn;

use super::codec;
use super::headers::HeaderList;
use super::part::{Body, MimePart, Multipart};
use crate::config::GatewayConfig;

/// Stored content of one offloaded attachment.
#[derive(Debug, Clone)]
pub struct AttachmentContent {
    pub headers: HeaderList,
    /// Decoded bytes.
    pub payload: Vec<u8>,
}

/// Attachment ids referenced by placeholders anywhere in the tree, in order.
pub fn placeholder_ids(part: &MimePart, config: &GatewayConfig) -> Vec<String> {
    part.walk()
        .into_iter()
        .filter_map(|p| p.headers.get(&config.attachment_interpolation_header))
        .collect()
}

/// Replace every placeholder with the attachment it references. Unknown ids
/// produce an empty part flagged with the altered-message header.
pub fn rehydrate(
    part: &MimePart,
    attachments: &HashMap<String, AttachmentContent>,
    config: &GatewayConfig,
) -> MimePart {
    match &part.body {
        Body::Multipart(mp) => {
            let parts = mp
                .parts
                .iter()
                .map(|p| rehydrate(p, attachments, config))
                .collect();
            MimePart {
                headers: part.headers.clone(),
                body: Body::Multipart(Multipart {
                    boundary: mp.boundary.clone(),
                    preamble: mp.preamble.clone(),
                    parts,
                    epilogue: mp.epilogue.clone(),
                    closed: mp.closed,
                }),
                eol: part.eol,
                separator: part.separator,
                zero_length: part.zero_length,
            }
        }
        Body::Message(inner) => MimePart {
            headers: part.headers.clone(),
            body: Body::Message(Box::new(rehydrate(inner, attachments, config))),
            eol: part.eol,
            separator: part.separator,
            zero_length: part.zero_length,
        },
        Body::Leaf(_) => match part.headers.get(&config.attachment_interpolation_header) {
            Some(id) => restore(&id, attachments.get(&id), part, config),
            None => part.clone(),
        },
    }
}

fn restore(
    id: &str,
    attachment: Option<&AttachmentContent>,
    placeholder: &MimePart,
    config: &GatewayConfig,
) -> MimePart {
    let eol = placeholder.eol;
    let Some(attachment) = attachment else {
        warn!(attachment_id = %id, "Attachment referenced by message not found");
        let mut headers = HeaderList::new();
        headers.append(
            config.altered_message_header.clone(),
            &format!("Missing; Attachment {id} not found"),
        );
        return MimePart::leaf(headers, Vec::new(), eol);
    };

    let mut headers = attachment.headers.clone();
    let quoted_printable = headers
        .get("content-transfer-encoding")
        .is_some_and(|cte| cte.trim().eq_ignore_ascii_case("quoted-printable"));

    let payload = if quoted_printable {
        codec::qp_encode(&attachment.payload, eol.as_bytes())
    } else {
        headers.replace("Content-Transfer-Encoding", "base64");
        codec::base64_encode(&attachment.payload, eol.as_bytes())
    };
    MimePart::leaf(headers, payload, eol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::dehydrate;

    fn as_map(d: &dehydrate::Dehydrated) -> HashMap<String, AttachmentContent> {
        d.attachments
            .iter()
            .map(|a| {
                (
                    a.id.to_string(),
                    AttachmentContent {
                        headers: a.headers.clone(),
                        payload: a.payload.clone(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn text_only_round_trip_is_exact() {
        let raw = b"From: a@example.com\r\n\
Content-Type: multipart/alternative; boundary=\"alt\"\r\n\
\r\n\
--alt\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\
\r\n\
caf=C3=A9 =\r\n\
time\r\n\
--alt\r\n\
Content-Type: text/html\r\n\
\r\n\
<b>hi</b>\r\n\
--alt--\r\n";
        let cfg = GatewayConfig::default();
        let inputs: [&[u8]; 4] = [
            raw,
            b"Subject: hi\r\n",
            b"",
            b"Content-Type: multipart/mixed; boundary=b\n\n--b\n--b\nContent-Type: text/plain\n\nx\n--b--\n",
        ];
        for input in inputs {
            let dry = dehydrate::dehydrate(input, &cfg).unwrap();
            let wet = rehydrate(&dry.message, &HashMap::new(), &cfg);
            assert_eq!(wet.to_bytes().unwrap(), input);
        }
    }

    #[test]
    fn attachment_payload_and_headers_survive() {
        let raw = b"Content-Type: multipart/mixed; boundary=m\n\n\
--m\n\
Content-Type: text/plain\n\n\
body\n\
--m\n\
Content-Type: application/pdf; name=\"report.pdf\"\n\
Content-Disposition: attachment; filename=\"report.pdf\"\n\
Content-Transfer-Encoding: base64\n\n\
JVBERi0xLjQKJcfs\n\
--m--\n";
        let cfg = GatewayConfig::default();
        let dry = dehydrate::dehydrate(raw, &cfg).unwrap();
        assert_eq!(placeholder_ids(&dry.message, &cfg).len(), 1);

        let wet = rehydrate(&dry.message, &as_map(&dry), &cfg);
        let original = MimePart::parse(raw);
        let before = original.walk()[2];
        let after = wet.walk()[2];
        assert_eq!(after.decoded_payload(), before.decoded_payload());
        assert_eq!(after.filename().as_deref(), Some("report.pdf"));
        assert_eq!(after.content_type(), "application/pdf");
    }

    #[test]
    fn quoted_printable_attachment_keeps_its_encoding() {
        let raw = b"Content-Type: multipart/mixed; boundary=q\r\n\r\n\
--q\r\n\
Content-Type: text/csv\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\r\n\
a,b\t=20\r\n\
--q--\r\n";
        let cfg = GatewayConfig::default();
        let dry = dehydrate::dehydrate(raw, &cfg).unwrap();
        let wet = rehydrate(&dry.message, &as_map(&dry), &cfg);
        let part = wet.walk()[1];
        assert_eq!(part.transfer_encoding().as_deref(), Some("quoted-printable"));
        assert_eq!(part.decoded_payload(), b"a,b\t ");
    }

    #[test]
    fn missing_attachment_yields_marker_part() {
        let cfg = GatewayConfig::default();
        let mut headers = HeaderList::new();
        headers.append(cfg.attachment_interpolation_header.clone(), "nope");
        let placeholder = MimePart::leaf(headers, Vec::new(), crate::mime::LineEnding::Crlf);

        let wet = rehydrate(&placeholder, &HashMap::new(), &cfg);
        assert_eq!(
            wet.headers.get(&cfg.altered_message_header).unwrap(),
            "Missing; Attachment nope not found"
        );
        assert!(wet.decoded_payload().is_empty());
    }
}

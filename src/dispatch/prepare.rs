//! Phase 1: render messages into ready-to-send form.

use std::sync::Arc;

use crate::error::{Error, RenderError};
use crate::models::OutgoingMessage;
use crate::storage::AttachmentStore;
use crate::template::TemplateRenderer;
use crate::transport::message::EmailParts;
use crate::transport::{Backend, PreparedAttachment, PreparedEmail};

use super::DeliveryFailure;

/// A rendered message paired with the backend it goes out through.
pub(crate) struct Prepared {
    pub email: PreparedEmail,
    pub backend: Arc<dyn Backend>,
}

/// Subject, plain body and optional html body after template substitution.
pub(crate) fn render_fields(
    message: &OutgoingMessage,
    renderer: &dyn TemplateRenderer,
) -> Result<(String, String, Option<String>), RenderError> {
    let (subject, text, html) = match &message.template {
        Some(template) => (
            renderer.render(&template.subject, &message.context)?,
            renderer.render(&template.content, &message.context)?,
            renderer.render(&template.html_content, &message.context)?,
        ),
        None => (
            message.subject.clone(),
            message.message.clone(),
            message.html_message.clone(),
        ),
    };
    let html = if html.trim().is_empty() { None } else { Some(html) };
    Ok((subject, text, html))
}

/// Render one message and load its attachments.
pub(crate) async fn prepare(
    message: &OutgoingMessage,
    backend: Result<Arc<dyn Backend>, DeliveryFailure>,
    renderer: &dyn TemplateRenderer,
    store: &dyn AttachmentStore,
) -> Result<Prepared, DeliveryFailure> {
    let backend = backend?;
    let (subject, text_body, html_body) = render_fields(message, renderer).map_err(Error::from)?;

    let mut attachments = Vec::with_capacity(message.attachments.len());
    for attachment in &message.attachments {
        let content = store.read(&attachment.file).await.map_err(Error::from)?;
        attachments.push(PreparedAttachment {
            name: attachment.name.clone(),
            mimetype: attachment.mimetype.clone(),
            content,
        });
    }

    let email = PreparedEmail::build(EmailParts {
        id: message.id,
        backend_alias: message.backend_alias.clone(),
        from: message.from_email.clone(),
        to: message.to.clone(),
        cc: message.cc.clone(),
        bcc: message.bcc.clone(),
        subject,
        text_body,
        html_body,
        headers: message.headers.clone(),
        attachments,
    })
    .map_err(Error::from)?;

    Ok(Prepared { email, backend })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::models::{EmailTemplate, OutgoingAttachment};
    use crate::storage::MemoryStore;
    use crate::template::SimpleRenderer;
    use crate::transport::LocmemBackend;
    use uuid::Uuid;

    fn backend() -> Result<Arc<dyn Backend>, DeliveryFailure> {
        Ok(Arc::new(LocmemBackend::new()))
    }

    #[test]
    fn template_takes_precedence_over_direct_fields() {
        let mut context = BTreeMap::new();
        context.insert("name".to_string(), "Ann".to_string());
        let msg = OutgoingMessage::new("a@example.com", vec!["b@example.com".into()])
            .with_subject("ignored")
            .with_html("<p>ignored</p>")
            .with_template(EmailTemplate::new("t", "Hi {{ name }}", "<p>Hi {{ name }}</p>").with_content("Plain for {{ name }}"))
            .with_context(context);

        let (subject, text, html) = render_fields(&msg, &SimpleRenderer::default()).unwrap();
        assert_eq!(subject, "Hi Ann");
        assert_eq!(text, "Plain for Ann");
        assert_eq!(html.as_deref(), Some("<p>Hi Ann</p>"));
    }

    #[test]
    fn empty_html_is_omitted() {
        let msg = OutgoingMessage::new("a@example.com", vec!["b@example.com".into()])
            .with_message("x")
            .with_html("  \n");
        let (_, text, html) = render_fields(&msg, &SimpleRenderer::default()).unwrap();
        assert_eq!(text, "x");
        assert_eq!(html, None);
    }

    #[tokio::test]
    async fn missing_variable_fails_before_delivery() {
        let msg = OutgoingMessage::new("a@example.com", vec!["b@example.com".into()])
            .with_template(EmailTemplate::new("t", "Hi {{ name }}", ""));
        let store = MemoryStore::new();
        let err = prepare(&msg, backend(), &SimpleRenderer::default(), &store)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, "MissingVariable");
    }

    #[tokio::test]
    async fn attachments_are_loaded_from_the_store() {
        let store = MemoryStore::new();
        let file = store.save(b"report", "report.txt").await.unwrap();
        let mut msg = OutgoingMessage::new("a@example.com", vec!["b@example.com".into()]).with_message("see attached");
        msg.attachments.push(OutgoingAttachment {
            id: Uuid::new_v4(),
            name: "report.txt".into(),
            file,
            mimetype: Some("text/plain".into()),
        });

        let prepared = prepare(&msg, backend(), &SimpleRenderer::default(), &store)
            .await
            .ok()
            .unwrap();
        assert_eq!(prepared.email.attachments[0].content, b"report");
        assert_eq!(prepared.backend.name(), "locmem");
    }

    #[tokio::test]
    async fn backend_failure_is_carried_through() {
        let msg = OutgoingMessage::new("a@example.com", vec!["b@example.com".into()]);
        let store = MemoryStore::new();
        let err = prepare(
            &msg,
            Err(DeliveryFailure::new("ActiveOutbox", "none active")),
            &SimpleRenderer::default(),
            &store,
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.kind, "ActiveOutbox");
    }
}

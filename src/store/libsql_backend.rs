//! libSQL repository — async `Repository` trait implementation.
//!
//! Supports local file and in-memory databases. Multi-statement writes
//! (bulk inserts, batch outcomes, outbox activation) run in a transaction.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::ExposeSecret;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SortKey;
use crate::error::DatabaseError;
use crate::models::{
    DeliveryLogEntry, EmailTemplate, IncomingAttachment, IncomingMessage, Mailbox, OutboxConfiguration,
    OutgoingAttachment, OutgoingMessage, Priority, Status,
};
use crate::store::migrations;
use crate::store::traits::Repository;

/// libSQL repository.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlRepository {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlRepository {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let repo = Self::from_database(db)?;
        repo.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(repo)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        let repo = Self::from_database(db)?;
        repo.run_migrations().await?;
        Ok(repo)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Attachments linked to one outgoing message, in link order.
    async fn attachments_for(&self, email_id: Uuid) -> Result<Vec<OutgoingAttachment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT a.id, a.name, a.file, a.mimetype
                 FROM outgoing_attachments a
                 JOIN outgoing_attachment_links l ON l.attachment_id = a.id
                 WHERE l.email_id = ?1
                 ORDER BY l.position ASC",
                params![email_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("attachments_for: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(row_to_outgoing_attachment(&row)?);
        }
        Ok(out)
    }

    /// Fill in template and attachments for rows read from `outgoing_emails`.
    async fn hydrate_outgoing(
        &self,
        rows: Vec<(OutgoingMessage, Option<Uuid>)>,
    ) -> Result<Vec<OutgoingMessage>, DatabaseError> {
        let mut out = Vec::with_capacity(rows.len());
        for (mut message, template_id) in rows {
            if let Some(template_id) = template_id {
                message.template = self.get_template(template_id).await?;
                if message.template.is_none() {
                    warn!(email_id = %message.id, %template_id, "Outgoing message references a missing template");
                }
            }
            message.attachments = self.attachments_for(message.id).await?;
            out.push(message);
        }
        Ok(out)
    }
}

// ── Helper functions ────────────────────────────────────────────────

const OUTGOING_COLUMNS: &str = "id, from_email, to_addrs, cc_addrs, bcc_addrs, subject, message, \
     html_message, template_id, context, scheduled_time, headers, priority, status, backend_alias, \
     created_at, updated_at";

const OUTBOX_COLUMNS: &str = "id, name, host, port, username, password, use_tls, use_ssl, \
     ssl_keyfile, ssl_certfile, timeout, active, created_at";

const INCOMING_COLUMNS: &str = "id, mailbox_id, subject, message_id, in_reply_to, from_header, \
     to_header, body, encoded, eml, processed, read";

/// Fixed-width UTC timestamps so text comparison matches time order.
fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s:?}: {e}")))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<&DateTime<Utc>>) -> libsql::Value {
    opt_text(dt.map(fmt_datetime).as_deref())
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(raw: &str, column: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

/// JSON array of ids, for `IN (SELECT value FROM json_each(?))`.
fn id_array(ids: &[Uuid]) -> Result<String, DatabaseError> {
    to_json(&ids.iter().map(Uuid::to_string).collect::<Vec<_>>())
}

fn col<T: libsql::params::IntoValue>(v: T) -> libsql::Value {
    v.into_value().unwrap_or(libsql::Value::Null)
}

fn query_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

/// Map a row in `OUTGOING_COLUMNS` order. Template and attachments are
/// loaded separately; the template id is returned alongside.
fn row_to_outgoing(row: &libsql::Row) -> Result<(OutgoingMessage, Option<Uuid>), DatabaseError> {
    let err = query_err("outgoing row parse");
    let id: String = row.get(0).map_err(&err)?;
    let template_id: Option<String> = row.get(8).ok();
    let scheduled: Option<String> = row.get(10).ok();
    let status: Option<String> = row.get(13).ok();
    let created: String = row.get(15).map_err(&err)?;
    let updated: String = row.get(16).map_err(&err)?;

    let message = OutgoingMessage {
        id: parse_uuid(&id)?,
        from_email: row.get(1).map_err(&err)?,
        to: from_json(&row.get::<String>(2).map_err(&err)?, "to_addrs")?,
        cc: from_json(&row.get::<String>(3).map_err(&err)?, "cc_addrs")?,
        bcc: from_json(&row.get::<String>(4).map_err(&err)?, "bcc_addrs")?,
        subject: row.get(5).map_err(&err)?,
        message: row.get(6).map_err(&err)?,
        html_message: row.get(7).map_err(&err)?,
        template: None,
        context: from_json(&row.get::<String>(9).map_err(&err)?, "context")?,
        scheduled_time: parse_optional_datetime(&scheduled),
        headers: from_json(&row.get::<String>(11).map_err(&err)?, "headers")?,
        priority: Priority::from_i64(row.get(12).map_err(&err)?),
        status: status.and_then(|s| s.parse::<Status>().ok()),
        backend_alias: row.get(14).map_err(&err)?,
        attachments: Vec::new(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    };
    let template_id = template_id.as_deref().map(parse_uuid).transpose()?;
    Ok((message, template_id))
}

fn row_to_template(row: &libsql::Row) -> Result<EmailTemplate, DatabaseError> {
    let err = query_err("template row parse");
    let id: String = row.get(0).map_err(&err)?;
    let created: String = row.get(6).map_err(&err)?;
    Ok(EmailTemplate {
        id: parse_uuid(&id)?,
        name: row.get(1).map_err(&err)?,
        description: row.get(2).map_err(&err)?,
        subject: row.get(3).map_err(&err)?,
        content: row.get(4).map_err(&err)?,
        html_content: row.get(5).map_err(&err)?,
        created_at: parse_datetime(&created),
    })
}

fn row_to_outgoing_attachment(row: &libsql::Row) -> Result<OutgoingAttachment, DatabaseError> {
    let err = query_err("attachment row parse");
    let id: String = row.get(0).map_err(&err)?;
    Ok(OutgoingAttachment {
        id: parse_uuid(&id)?,
        name: row.get(1).map_err(&err)?,
        file: row.get(2).map_err(&err)?,
        mimetype: row.get(3).ok(),
    })
}

fn row_to_log(row: &libsql::Row) -> Result<DeliveryLogEntry, DatabaseError> {
    let err = query_err("log row parse");
    let id: String = row.get(0).map_err(&err)?;
    let email_id: String = row.get(1).map_err(&err)?;
    let date: String = row.get(2).map_err(&err)?;
    let status: String = row.get(3).map_err(&err)?;
    Ok(DeliveryLogEntry {
        id: parse_uuid(&id)?,
        email_id: parse_uuid(&email_id)?,
        date: parse_datetime(&date),
        status: status.parse().map_err(DatabaseError::Serialization)?,
        exception_type: row.get(4).map_err(&err)?,
        message: row.get(5).map_err(&err)?,
    })
}

fn row_to_outbox(row: &libsql::Row) -> Result<OutboxConfiguration, DatabaseError> {
    let err = query_err("outbox row parse");
    let id: String = row.get(0).map_err(&err)?;
    let password: String = row.get(5).map_err(&err)?;
    let created: String = row.get(12).map_err(&err)?;
    let port: i64 = row.get(3).map_err(&err)?;
    Ok(OutboxConfiguration {
        id: parse_uuid(&id)?,
        name: row.get(1).map_err(&err)?,
        host: row.get(2).map_err(&err)?,
        port: u16::try_from(port).map_err(|e| DatabaseError::Serialization(format!("port {port}: {e}")))?,
        username: row.get(4).map_err(&err)?,
        password: secrecy::SecretString::from(password),
        use_tls: row.get::<i64>(6).map_err(&err)? != 0,
        use_ssl: row.get::<i64>(7).map_err(&err)? != 0,
        ssl_keyfile: row.get(8).ok(),
        ssl_certfile: row.get(9).ok(),
        timeout: row.get::<i64>(10).ok().and_then(|t| u64::try_from(t).ok()),
        active: row.get::<i64>(11).map_err(&err)? != 0,
        created_at: parse_datetime(&created),
    })
}

fn row_to_mailbox(row: &libsql::Row) -> Result<Mailbox, DatabaseError> {
    let err = query_err("mailbox row parse");
    let id: String = row.get(0).map_err(&err)?;
    let last_polling: Option<String> = row.get(4).ok();
    Ok(Mailbox {
        id: parse_uuid(&id)?,
        name: row.get(1).map_err(&err)?,
        from_email: row.get(2).ok(),
        active: row.get::<i64>(3).map_err(&err)? != 0,
        last_polling: parse_optional_datetime(&last_polling),
    })
}

fn row_to_incoming(row: &libsql::Row) -> Result<IncomingMessage, DatabaseError> {
    let err = query_err("incoming row parse");
    let id: String = row.get(0).map_err(&err)?;
    let mailbox_id: String = row.get(1).map_err(&err)?;
    let in_reply_to: Option<String> = row.get(4).ok();
    let processed: String = row.get(10).map_err(&err)?;
    let read: Option<String> = row.get(11).ok();
    Ok(IncomingMessage {
        id: parse_uuid(&id)?,
        mailbox_id: parse_uuid(&mailbox_id)?,
        subject: row.get(2).map_err(&err)?,
        message_id: row.get(3).map_err(&err)?,
        in_reply_to: in_reply_to.as_deref().map(parse_uuid).transpose()?,
        from_header: row.get(5).map_err(&err)?,
        to_header: row.get(6).map_err(&err)?,
        body: row.get(7).map_err(&err)?,
        encoded: row.get::<i64>(8).map_err(&err)? != 0,
        eml: row.get(9).ok(),
        processed: parse_datetime(&processed),
        read: parse_optional_datetime(&read),
    })
}

fn row_to_incoming_attachment(row: &libsql::Row) -> Result<IncomingAttachment, DatabaseError> {
    let err = query_err("incoming attachment row parse");
    let id: String = row.get(0).map_err(&err)?;
    let message_id: Option<String> = row.get(1).ok();
    Ok(IncomingAttachment {
        id: parse_uuid(&id)?,
        message_id: message_id.as_deref().map(parse_uuid).transpose()?,
        headers: row.get(2).map_err(&err)?,
        document: row.get(3).map_err(&err)?,
    })
}

// ── Repository implementation ───────────────────────────────────────

#[async_trait]
impl Repository for LibSqlRepository {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Templates ───────────────────────────────────────────────────

    async fn insert_template(&self, template: &EmailTemplate) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO email_templates (id, name, description, subject, content, html_content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    template.id.to_string(),
                    template.name.clone(),
                    template.description.clone(),
                    template.subject.clone(),
                    template.content.clone(),
                    template.html_content.clone(),
                    fmt_datetime(&template.created_at),
                ],
            )
            .await
            .map_err(query_err("insert_template"))?;
        Ok(())
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<EmailTemplate>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, description, subject, content, html_content, created_at
                 FROM email_templates WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_template"))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_template(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_template: {e}"))),
        }
    }

    // ── Outgoing messages ───────────────────────────────────────────

    async fn insert_outgoing(&self, messages: &[OutgoingMessage]) -> Result<(), DatabaseError> {
        let tx = self.conn().transaction().await.map_err(query_err("insert_outgoing"))?;
        for msg in messages {
            tx.execute(
                &format!(
                    "INSERT INTO outgoing_emails ({OUTGOING_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                vec![
                    col(msg.id.to_string()),
                    col(msg.from_email.clone()),
                    col(to_json(&msg.to)?),
                    col(to_json(&msg.cc)?),
                    col(to_json(&msg.bcc)?),
                    col(msg.subject.clone()),
                    col(msg.message.clone()),
                    col(msg.html_message.clone()),
                    opt_text(msg.template.as_ref().map(|t| t.id.to_string()).as_deref()),
                    col(to_json(&msg.context)?),
                    opt_datetime(msg.scheduled_time.as_ref()),
                    col(to_json(&msg.headers)?),
                    col(msg.priority.as_i64()),
                    opt_text(msg.status.map(|s| s.to_string()).as_deref()),
                    col(msg.backend_alias.clone()),
                    col(fmt_datetime(&msg.created_at)),
                    col(fmt_datetime(&msg.updated_at)),
                ],
            )
            .await
            .map_err(query_err("insert_outgoing"))?;

            for (position, attachment) in msg.attachments.iter().enumerate() {
                tx.execute(
                    "INSERT OR IGNORE INTO outgoing_attachment_links (email_id, attachment_id, position)
                     VALUES (?1, ?2, ?3)",
                    params![msg.id.to_string(), attachment.id.to_string(), position as i64],
                )
                .await
                .map_err(query_err("insert_outgoing link"))?;
            }
        }
        tx.commit().await.map_err(query_err("insert_outgoing commit"))?;
        debug!(count = messages.len(), "Outgoing messages inserted");
        Ok(())
    }

    async fn get_outgoing(&self, id: Uuid) -> Result<Option<OutgoingMessage>, DatabaseError> {
        let row = {
            let mut rows = self
                .conn()
                .query(
                    &format!("SELECT {OUTGOING_COLUMNS} FROM outgoing_emails WHERE id = ?1"),
                    params![id.to_string()],
                )
                .await
                .map_err(query_err("get_outgoing"))?;
            match rows.next().await {
                Ok(Some(row)) => row_to_outgoing(&row)?,
                Ok(None) => return Ok(None),
                Err(e) => return Err(DatabaseError::Query(format!("get_outgoing: {e}"))),
            }
        };
        Ok(self.hydrate_outgoing(vec![row]).await?.pop())
    }

    async fn queued_batch(
        &self,
        now: DateTime<Utc>,
        order: &[SortKey],
        limit: usize,
    ) -> Result<Vec<OutgoingMessage>, DatabaseError> {
        let mut order_by: Vec<String> = order.iter().map(SortKey::to_sql).collect();
        order_by.push("created_at ASC".into());

        let mut found = Vec::new();
        let mut unreadable = Vec::new();
        {
            let mut rows = self
                .conn()
                .query(
                    &format!(
                        "SELECT {OUTGOING_COLUMNS} FROM outgoing_emails
                         WHERE status = 'queued' AND (scheduled_time IS NULL OR scheduled_time <= ?1)
                         ORDER BY {}
                         LIMIT ?2",
                        order_by.join(", ")
                    ),
                    params![fmt_datetime(&now), limit as i64],
                )
                .await
                .map_err(query_err("queued_batch"))?;
            loop {
                let row = match rows.next().await {
                    Ok(Some(row)) => row,
                    Ok(None) => break,
                    Err(e) => return Err(DatabaseError::Query(format!("queued_batch: {e}"))),
                };
                match row_to_outgoing(&row) {
                    Ok(parsed) => found.push(parsed),
                    Err(e) => match row.get::<String>(0).ok().and_then(|id| Uuid::parse_str(&id).ok()) {
                        Some(id) => unreadable.push(DeliveryLogEntry::failed(id, "DatabaseError", e.to_string())),
                        None => warn!("Unreadable outgoing row without a usable id: {e}"),
                    },
                }
            }
        }
        if !unreadable.is_empty() {
            let ids: Vec<Uuid> = unreadable.iter().map(|log| log.email_id).collect();
            warn!(count = ids.len(), "Marking unreadable queued messages as failed");
            self.record_delivery(&[], &ids, &unreadable).await?;
        }
        self.hydrate_outgoing(found).await
    }

    async fn record_delivery(
        &self,
        sent: &[Uuid],
        failed: &[Uuid],
        logs: &[DeliveryLogEntry],
    ) -> Result<(), DatabaseError> {
        let now = fmt_datetime(&Utc::now());
        let tx = self.conn().transaction().await.map_err(query_err("record_delivery"))?;
        for (status, ids) in [(Status::Sent, sent), (Status::Failed, failed)] {
            if ids.is_empty() {
                continue;
            }
            tx.execute(
                "UPDATE outgoing_emails SET status = ?1, updated_at = ?2
                 WHERE id IN (SELECT value FROM json_each(?3))",
                params![status.to_string(), now.clone(), id_array(ids)?],
            )
            .await
            .map_err(query_err("record_delivery status"))?;
        }
        for log in logs {
            tx.execute(
                "INSERT INTO delivery_logs (id, email_id, date, status, exception_type, message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    log.id.to_string(),
                    log.email_id.to_string(),
                    fmt_datetime(&log.date),
                    log.status.to_string(),
                    log.exception_type.clone(),
                    log.message.clone(),
                ],
            )
            .await
            .map_err(query_err("record_delivery log"))?;
        }
        tx.commit().await.map_err(query_err("record_delivery commit"))?;
        debug!(sent = sent.len(), failed = failed.len(), logs = logs.len(), "Delivery outcome recorded");
        Ok(())
    }

    async fn find_outgoing_by_message_id(&self, message_id: &str) -> Result<Option<Uuid>, DatabaseError> {
        let needle = format!("{}:{}", to_json("Message-ID")?, to_json(message_id)?);
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM outgoing_emails WHERE instr(headers, ?1) > 0
                 ORDER BY created_at DESC LIMIT 1",
                params![needle],
            )
            .await
            .map_err(query_err("find_outgoing_by_message_id"))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let id: String = row.get(0).map_err(query_err("find_outgoing_by_message_id"))?;
                Ok(Some(parse_uuid(&id)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_outgoing_by_message_id: {e}"))),
        }
    }

    async fn delete_outgoing_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let cutoff = fmt_datetime(&cutoff);
        let tx = self.conn().transaction().await.map_err(query_err("delete_outgoing_before"))?;
        for sql in [
            "DELETE FROM delivery_logs WHERE email_id IN
             (SELECT id FROM outgoing_emails WHERE created_at < ?1)",
            "DELETE FROM outgoing_attachment_links WHERE email_id IN
             (SELECT id FROM outgoing_emails WHERE created_at < ?1)",
        ] {
            tx.execute(sql, params![cutoff.clone()])
                .await
                .map_err(query_err("delete_outgoing_before"))?;
        }
        let deleted = tx
            .execute("DELETE FROM outgoing_emails WHERE created_at < ?1", params![cutoff])
            .await
            .map_err(query_err("delete_outgoing_before"))?;
        tx.commit().await.map_err(query_err("delete_outgoing_before commit"))?;
        Ok(deleted as usize)
    }

    // ── Outgoing attachments ────────────────────────────────────────

    async fn insert_outgoing_attachment(&self, attachment: &OutgoingAttachment) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO outgoing_attachments (id, name, file, mimetype) VALUES (?1, ?2, ?3, ?4)",
                params![
                    attachment.id.to_string(),
                    attachment.name.clone(),
                    attachment.file.clone(),
                    opt_text(attachment.mimetype.as_deref()),
                ],
            )
            .await
            .map_err(query_err("insert_outgoing_attachment"))?;
        Ok(())
    }

    async fn orphaned_outgoing_attachments(&self) -> Result<Vec<OutgoingAttachment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, file, mimetype FROM outgoing_attachments
                 WHERE id NOT IN (SELECT attachment_id FROM outgoing_attachment_links)",
                (),
            )
            .await
            .map_err(query_err("orphaned_outgoing_attachments"))?;
        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(row_to_outgoing_attachment(&row)?);
        }
        Ok(out)
    }

    async fn delete_outgoing_attachment(&self, id: Uuid) -> Result<(), DatabaseError> {
        let tx = self.conn().transaction().await.map_err(query_err("delete_outgoing_attachment"))?;
        tx.execute(
            "DELETE FROM outgoing_attachment_links WHERE attachment_id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(query_err("delete_outgoing_attachment"))?;
        tx.execute("DELETE FROM outgoing_attachments WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(query_err("delete_outgoing_attachment"))?;
        tx.commit().await.map_err(query_err("delete_outgoing_attachment commit"))?;
        Ok(())
    }

    // ── Delivery logs ───────────────────────────────────────────────

    async fn logs_for(&self, email_id: Uuid) -> Result<Vec<DeliveryLogEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, email_id, date, status, exception_type, message
                 FROM delivery_logs WHERE email_id = ?1 ORDER BY date ASC",
                params![email_id.to_string()],
            )
            .await
            .map_err(query_err("logs_for"))?;
        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(row_to_log(&row)?);
        }
        Ok(out)
    }

    // ── Outbox configurations ───────────────────────────────────────

    async fn save_outbox(&self, outbox: &OutboxConfiguration) -> Result<(), DatabaseError> {
        let tx = self.conn().transaction().await.map_err(query_err("save_outbox"))?;
        tx.execute(
            &format!(
                "INSERT INTO outboxes ({OUTBOX_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name, host = excluded.host, port = excluded.port,
                    username = excluded.username, password = excluded.password,
                    use_tls = excluded.use_tls, use_ssl = excluded.use_ssl,
                    ssl_keyfile = excluded.ssl_keyfile, ssl_certfile = excluded.ssl_certfile,
                    timeout = excluded.timeout, active = excluded.active"
            ),
            vec![
                col(outbox.id.to_string()),
                col(outbox.name.clone()),
                col(outbox.host.clone()),
                col(i64::from(outbox.port)),
                col(outbox.username.clone()),
                col(outbox.password.expose_secret().to_string()),
                col(i64::from(outbox.use_tls)),
                col(i64::from(outbox.use_ssl)),
                opt_text(outbox.ssl_keyfile.as_deref()),
                opt_text(outbox.ssl_certfile.as_deref()),
                outbox
                    .timeout
                    .and_then(|t| i64::try_from(t).ok())
                    .map(libsql::Value::Integer)
                    .unwrap_or(libsql::Value::Null),
                col(i64::from(outbox.active)),
                col(fmt_datetime(&outbox.created_at)),
            ],
        )
        .await
        .map_err(query_err("save_outbox"))?;

        if outbox.active {
            tx.execute(
                "UPDATE outboxes SET active = 0 WHERE id != ?1",
                params![outbox.id.to_string()],
            )
            .await
            .map_err(query_err("save_outbox deactivate"))?;
        }
        tx.commit().await.map_err(query_err("save_outbox commit"))?;
        debug!(outbox_id = %outbox.id, active = outbox.active, "Outbox saved");
        Ok(())
    }

    async fn get_outbox(&self, id: Uuid) -> Result<Option<OutboxConfiguration>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {OUTBOX_COLUMNS} FROM outboxes WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_outbox"))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_outbox(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_outbox: {e}"))),
        }
    }

    async fn active_outboxes(&self) -> Result<Vec<OutboxConfiguration>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {OUTBOX_COLUMNS} FROM outboxes WHERE active = 1 ORDER BY created_at ASC"),
                (),
            )
            .await
            .map_err(query_err("active_outboxes"))?;
        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(row_to_outbox(&row)?);
        }
        Ok(out)
    }

    // ── Mailboxes ───────────────────────────────────────────────────

    async fn save_mailbox(&self, mailbox: &Mailbox) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO mailboxes (id, name, from_email, active, last_polling)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name, from_email = excluded.from_email,
                    active = excluded.active, last_polling = excluded.last_polling",
                params![
                    mailbox.id.to_string(),
                    mailbox.name.clone(),
                    opt_text(mailbox.from_email.as_deref()),
                    i64::from(mailbox.active),
                    opt_datetime(mailbox.last_polling.as_ref()),
                ],
            )
            .await
            .map_err(query_err("save_mailbox"))?;
        Ok(())
    }

    async fn get_mailbox(&self, id: Uuid) -> Result<Option<Mailbox>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, from_email, active, last_polling FROM mailboxes WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_mailbox"))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_mailbox(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_mailbox: {e}"))),
        }
    }

    async fn active_mailboxes(&self) -> Result<Vec<Mailbox>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, from_email, active, last_polling FROM mailboxes WHERE active = 1 ORDER BY name",
                (),
            )
            .await
            .map_err(query_err("active_mailboxes"))?;
        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(row_to_mailbox(&row)?);
        }
        Ok(out)
    }

    async fn update_last_polling(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE mailboxes SET last_polling = ?1 WHERE id = ?2",
                params![fmt_datetime(&at), id.to_string()],
            )
            .await
            .map_err(query_err("update_last_polling"))?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "mailbox".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ── Incoming messages ───────────────────────────────────────────

    async fn insert_incoming(
        &self,
        message: &IncomingMessage,
        attachments: &[IncomingAttachment],
    ) -> Result<(), DatabaseError> {
        let tx = self.conn().transaction().await.map_err(query_err("insert_incoming"))?;
        tx.execute(
            &format!(
                "INSERT INTO incoming_messages ({INCOMING_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            vec![
                col(message.id.to_string()),
                col(message.mailbox_id.to_string()),
                col(message.subject.clone()),
                col(message.message_id.clone()),
                opt_text(message.in_reply_to.map(|id| id.to_string()).as_deref()),
                col(message.from_header.clone()),
                col(message.to_header.clone()),
                col(message.body.clone()),
                col(i64::from(message.encoded)),
                opt_text(message.eml.as_deref()),
                col(fmt_datetime(&message.processed)),
                opt_datetime(message.read.as_ref()),
            ],
        )
        .await
        .map_err(query_err("insert_incoming"))?;

        for attachment in attachments {
            tx.execute(
                "INSERT INTO incoming_attachments (id, message_id, headers, document) VALUES (?1, ?2, ?3, ?4)",
                params![
                    attachment.id.to_string(),
                    opt_text(attachment.message_id.map(|id| id.to_string()).as_deref()),
                    attachment.headers.clone(),
                    attachment.document.clone(),
                ],
            )
            .await
            .map_err(query_err("insert_incoming attachment"))?;
        }
        tx.commit().await.map_err(query_err("insert_incoming commit"))?;
        debug!(message_id = %message.id, attachments = attachments.len(), "Incoming message inserted");
        Ok(())
    }

    async fn get_incoming(&self, id: Uuid) -> Result<Option<IncomingMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {INCOMING_COLUMNS} FROM incoming_messages WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_incoming"))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_incoming(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_incoming: {e}"))),
        }
    }

    async fn unread_incoming(&self, mailbox_id: Option<Uuid>) -> Result<Vec<IncomingMessage>, DatabaseError> {
        let mut rows = match mailbox_id {
            Some(mailbox_id) => self
                .conn()
                .query(
                    &format!(
                        "SELECT {INCOMING_COLUMNS} FROM incoming_messages
                         WHERE read IS NULL AND mailbox_id = ?1 ORDER BY processed ASC"
                    ),
                    params![mailbox_id.to_string()],
                )
                .await,
            None => self
                .conn()
                .query(
                    &format!(
                        "SELECT {INCOMING_COLUMNS} FROM incoming_messages
                         WHERE read IS NULL ORDER BY processed ASC"
                    ),
                    (),
                )
                .await,
        }
        .map_err(query_err("unread_incoming"))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(row_to_incoming(&row)?);
        }
        Ok(out)
    }

    async fn mark_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE incoming_messages SET read = ?1 WHERE id = ?2",
                params![fmt_datetime(&at), id.to_string()],
            )
            .await
            .map_err(query_err("mark_read"))?;
        Ok(())
    }

    async fn delete_incoming(&self, id: Uuid) -> Result<(), DatabaseError> {
        let tx = self.conn().transaction().await.map_err(query_err("delete_incoming"))?;
        tx.execute(
            "UPDATE incoming_attachments SET message_id = NULL WHERE message_id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(query_err("delete_incoming orphan"))?;
        tx.execute("DELETE FROM incoming_messages WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(query_err("delete_incoming"))?;
        tx.commit().await.map_err(query_err("delete_incoming commit"))?;
        Ok(())
    }

    async fn incoming_attachments(&self, message_id: Uuid) -> Result<Vec<IncomingAttachment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, message_id, headers, document FROM incoming_attachments WHERE message_id = ?1",
                params![message_id.to_string()],
            )
            .await
            .map_err(query_err("incoming_attachments"))?;
        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(row_to_incoming_attachment(&row)?);
        }
        Ok(out)
    }

    async fn get_incoming_attachment(&self, id: Uuid) -> Result<Option<IncomingAttachment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, message_id, headers, document FROM incoming_attachments WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_incoming_attachment"))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_incoming_attachment(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_incoming_attachment: {e}"))),
        }
    }

    async fn delete_incoming_attachment(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute("DELETE FROM incoming_attachments WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(query_err("delete_incoming_attachment"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SortField;
    use crate::models::DeliveryOutcome;

    async fn repo() -> LibSqlRepository {
        LibSqlRepository::new_memory().await.unwrap()
    }

    fn queued(priority: Priority) -> OutgoingMessage {
        OutgoingMessage::new("from@example.com", vec!["to@example.com".into()])
            .with_subject(format!("{priority}"))
            .with_priority(priority)
    }

    #[tokio::test]
    async fn outgoing_round_trip_with_template_and_attachment() {
        let repo = repo().await;
        let template = EmailTemplate::new("welcome", "Hi {{ name }}", "<p>Hi {{ name }}</p>");
        repo.insert_template(&template).await.unwrap();

        let attachment = OutgoingAttachment {
            id: Uuid::new_v4(),
            name: "terms.pdf".into(),
            file: "attachments/terms.pdf".into(),
            mimetype: Some("application/pdf".into()),
        };
        repo.insert_outgoing_attachment(&attachment).await.unwrap();

        let mut msg = queued(Priority::High)
            .with_template(template.clone())
            .with_header("Message-ID", "<abc@example.com>")
            .with_scheduled_time(Utc::now());
        msg.context.insert("name".into(), "Ann".into());
        msg.attachments.push(attachment.clone());
        repo.insert_outgoing(std::slice::from_ref(&msg)).await.unwrap();

        let loaded = repo.get_outgoing(msg.id).await.unwrap().unwrap();
        assert_eq!(loaded.template.as_ref().map(|t| t.id), Some(template.id));
        assert_eq!(loaded.attachments, vec![attachment]);
        assert_eq!(loaded.context.get("name").map(String::as_str), Some("Ann"));
        assert_eq!(loaded.priority, Priority::High);
        assert_eq!(loaded.status, Some(Status::Queued));
        assert!(loaded.scheduled_time.is_some());
    }

    #[tokio::test]
    async fn queued_batch_orders_and_filters() {
        let repo = repo().await;
        let now = Utc::now();
        let low = queued(Priority::Low);
        let high = queued(Priority::High);
        let medium = queued(Priority::Medium);
        let future = queued(Priority::High).with_scheduled_time(now + chrono::Duration::hours(1));
        let immediate = queued(Priority::Now);
        repo.insert_outgoing(&[low.clone(), high.clone(), medium.clone(), future, immediate])
            .await
            .unwrap();

        let order = [SortKey::desc(SortField::Priority)];
        let batch = repo.queued_batch(now, &order, 2).await.unwrap();
        let ids: Vec<Uuid> = batch.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![high.id, medium.id]);

        let all = repo.queued_batch(now, &order, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].id, low.id);
    }

    #[tokio::test]
    async fn queued_batch_fails_unreadable_rows() {
        let repo = repo().await;
        let good = queued(Priority::Medium);
        let bad = queued(Priority::Medium);
        repo.insert_outgoing(&[good.clone(), bad.clone()]).await.unwrap();
        repo.conn()
            .execute(
                "UPDATE outgoing_emails SET to_addrs = 'not json' WHERE id = ?1",
                params![bad.id.to_string()],
            )
            .await
            .unwrap();

        let batch = repo.queued_batch(Utc::now(), &[], 10).await.unwrap();
        let ids: Vec<Uuid> = batch.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![good.id]);

        let logs = repo.logs_for(bad.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, DeliveryOutcome::Failed);
        assert_eq!(logs[0].exception_type, "DatabaseError");

        let again = repo.queued_batch(Utc::now(), &[], 10).await.unwrap();
        assert_eq!(again.len(), 1);
        let status: String = {
            let mut rows = repo
                .conn()
                .query("SELECT status FROM outgoing_emails WHERE id = ?1", params![bad.id.to_string()])
                .await
                .unwrap();
            rows.next().await.unwrap().unwrap().get(0).unwrap()
        };
        assert_eq!(status, "failed");
    }

    #[tokio::test]
    async fn record_delivery_updates_statuses_and_logs() {
        let repo = repo().await;
        let a = queued(Priority::Medium);
        let b = queued(Priority::Medium);
        repo.insert_outgoing(&[a.clone(), b.clone()]).await.unwrap();

        let logs = vec![DeliveryLogEntry::failed(b.id, "Rejected", "550 no such user")];
        repo.record_delivery(&[a.id], &[b.id], &logs).await.unwrap();

        assert_eq!(repo.get_outgoing(a.id).await.unwrap().unwrap().status, Some(Status::Sent));
        assert_eq!(repo.get_outgoing(b.id).await.unwrap().unwrap().status, Some(Status::Failed));
        let stored = repo.logs_for(b.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, DeliveryOutcome::Failed);
        assert_eq!(stored[0].exception_type, "Rejected");
        assert!(repo.logs_for(a.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn activating_an_outbox_deactivates_the_rest() {
        let repo = repo().await;
        let a = OutboxConfiguration::new("a", "smtp.a.example", "u", "p").active();
        repo.save_outbox(&a).await.unwrap();
        let b = OutboxConfiguration::new("b", "smtp.b.example", "u", "p").active();
        repo.save_outbox(&b).await.unwrap();

        let active = repo.active_outboxes().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b.id);
        assert!(!repo.get_outbox(a.id).await.unwrap().unwrap().active);
        assert_eq!(
            repo.get_outbox(b.id).await.unwrap().unwrap().password.expose_secret(),
            "p"
        );
    }

    #[tokio::test]
    async fn message_id_lookup_uses_serialized_headers() {
        let repo = repo().await;
        let msg = queued(Priority::Medium).with_header("Message-ID", "<id-1@example.com>");
        repo.insert_outgoing(std::slice::from_ref(&msg)).await.unwrap();

        assert_eq!(
            repo.find_outgoing_by_message_id("<id-1@example.com>").await.unwrap(),
            Some(msg.id)
        );
        assert_eq!(repo.find_outgoing_by_message_id("<other@example.com>").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incoming_delete_orphans_attachments() {
        let repo = repo().await;
        let mailbox = Mailbox::new("inbox");
        repo.save_mailbox(&mailbox).await.unwrap();

        let mut msg = IncomingMessage::new(mailbox.id);
        msg.subject = "hello".into();
        msg.set_body(b"Subject: hello\r\n\r\nbody");
        let att = IncomingAttachment {
            id: Uuid::new_v4(),
            message_id: Some(msg.id),
            headers: "Content-Type: image/png\n".into(),
            document: "a/b.png".into(),
        };
        repo.insert_incoming(&msg, std::slice::from_ref(&att)).await.unwrap();

        assert_eq!(repo.unread_incoming(Some(mailbox.id)).await.unwrap().len(), 1);
        assert_eq!(repo.get_incoming(msg.id).await.unwrap().unwrap(), msg);

        repo.mark_read(msg.id, Utc::now()).await.unwrap();
        assert!(repo.unread_incoming(None).await.unwrap().is_empty());

        repo.delete_incoming(msg.id).await.unwrap();
        assert!(repo.get_incoming(msg.id).await.unwrap().is_none());
        let orphan = repo.get_incoming_attachment(att.id).await.unwrap().unwrap();
        assert_eq!(orphan.message_id, None);
    }

    #[tokio::test]
    async fn cleanup_removes_old_messages_and_logs() {
        let repo = repo().await;
        let mut old = queued(Priority::Low);
        old.created_at = Utc::now() - chrono::Duration::days(120);
        let fresh = queued(Priority::Low);
        repo.insert_outgoing(&[old.clone(), fresh.clone()]).await.unwrap();
        repo.record_delivery(&[old.id], &[], &[DeliveryLogEntry::sent(old.id)])
            .await
            .unwrap();

        let deleted = repo
            .delete_outgoing_before(Utc::now() - chrono::Duration::days(90))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(repo.get_outgoing(old.id).await.unwrap().is_none());
        assert!(repo.logs_for(old.id).await.unwrap().is_empty());
        assert!(repo.get_outgoing(fresh.id).await.unwrap().is_some());
    }
}

//! Version-tracked database migrations for the libSQL repository.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "outgoing_mail",
        sql: r#"
            CREATE TABLE IF NOT EXISTS email_templates (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                subject TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                html_content TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS outgoing_emails (
                id TEXT PRIMARY KEY,
                from_email TEXT NOT NULL,
                to_addrs TEXT NOT NULL DEFAULT '[]',
                cc_addrs TEXT NOT NULL DEFAULT '[]',
                bcc_addrs TEXT NOT NULL DEFAULT '[]',
                subject TEXT NOT NULL DEFAULT '',
                message TEXT NOT NULL DEFAULT '',
                html_message TEXT NOT NULL DEFAULT '',
                template_id TEXT REFERENCES email_templates(id),
                context TEXT NOT NULL DEFAULT '{}',
                scheduled_time TEXT,
                headers TEXT NOT NULL DEFAULT '{}',
                priority INTEGER NOT NULL DEFAULT 1,
                status TEXT,
                backend_alias TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_outgoing_status ON outgoing_emails(status);
            CREATE INDEX IF NOT EXISTS idx_outgoing_scheduled ON outgoing_emails(scheduled_time);
            CREATE INDEX IF NOT EXISTS idx_outgoing_created ON outgoing_emails(created_at);

            CREATE TABLE IF NOT EXISTS outgoing_attachments (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                file TEXT NOT NULL,
                mimetype TEXT
            );

            CREATE TABLE IF NOT EXISTS outgoing_attachment_links (
                email_id TEXT NOT NULL REFERENCES outgoing_emails(id) ON DELETE CASCADE,
                attachment_id TEXT NOT NULL REFERENCES outgoing_attachments(id) ON DELETE CASCADE,
                position INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (email_id, attachment_id)
            );

            CREATE TABLE IF NOT EXISTS delivery_logs (
                id TEXT PRIMARY KEY,
                email_id TEXT NOT NULL REFERENCES outgoing_emails(id) ON DELETE CASCADE,
                date TEXT NOT NULL,
                status TEXT NOT NULL,
                exception_type TEXT NOT NULL DEFAULT '',
                message TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_delivery_logs_email ON delivery_logs(email_id);

            CREATE TABLE IF NOT EXISTS outboxes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT NOT NULL DEFAULT '',
                password TEXT NOT NULL DEFAULT '',
                use_tls INTEGER NOT NULL DEFAULT 0,
                use_ssl INTEGER NOT NULL DEFAULT 0,
                ssl_keyfile TEXT,
                ssl_certfile TEXT,
                timeout INTEGER,
                active INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_outboxes_active ON outboxes(active);
        "#,
    },
    Migration {
        version: 2,
        name: "incoming_mail",
        sql: r#"
            CREATE TABLE IF NOT EXISTS mailboxes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                from_email TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                last_polling TEXT
            );

            CREATE TABLE IF NOT EXISTS incoming_messages (
                id TEXT PRIMARY KEY,
                mailbox_id TEXT NOT NULL REFERENCES mailboxes(id) ON DELETE CASCADE,
                subject TEXT NOT NULL DEFAULT '',
                message_id TEXT NOT NULL DEFAULT '',
                in_reply_to TEXT REFERENCES outgoing_emails(id) ON DELETE SET NULL,
                from_header TEXT NOT NULL DEFAULT '',
                to_header TEXT NOT NULL DEFAULT '',
                body TEXT NOT NULL DEFAULT '',
                encoded INTEGER NOT NULL DEFAULT 0,
                eml TEXT,
                processed TEXT NOT NULL,
                read TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_incoming_mailbox ON incoming_messages(mailbox_id);
            CREATE INDEX IF NOT EXISTS idx_incoming_read ON incoming_messages(read);

            CREATE TABLE IF NOT EXISTS incoming_attachments (
                id TEXT PRIMARY KEY,
                message_id TEXT REFERENCES incoming_messages(id) ON DELETE SET NULL,
                headers TEXT NOT NULL DEFAULT '',
                document TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_incoming_attachments_message ON incoming_attachments(message_id);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row
            .get(0)
            .map_err(|e| DatabaseError::Migration(format!("Failed to parse migration version: {e}"))),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mail_gateway::config::GatewayConfig;
use mail_gateway::dispatch::DispatchEngine;
use mail_gateway::events::GatewayEvent;
use mail_gateway::storage::FileStore;
use mail_gateway::store::{LibSqlRepository, Repository};
use mail_gateway::transport::{BackendRegistry, LocmemBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = GatewayConfig::from_env().context("Invalid MAIL_GATEWAY_* configuration")?;

    let processes: usize = std::env::var("MAIL_GATEWAY_PROCESSES")
        .unwrap_or_else(|_| "1".to_string())
        .parse()
        .unwrap_or(1);

    let poll_secs: Option<u64> = std::env::var("MAIL_GATEWAY_POLL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|secs| *secs > 0);

    eprintln!("📮 Mail Gateway v{}", env!("CARGO_PKG_VERSION"));

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("MAIL_GATEWAY_DB_PATH").unwrap_or_else(|_| "./data/mail-gateway.db".to_string());
    let repo: Arc<dyn Repository> = Arc::new(
        LibSqlRepository::new_local(Path::new(&db_path))
            .await
            .with_context(|| format!("Failed to open database at {db_path}"))?,
    );
    eprintln!("   Database: {db_path}");

    // ── Attachment storage ───────────────────────────────────────────────
    let media_root =
        std::env::var("MAIL_GATEWAY_MEDIA_ROOT").unwrap_or_else(|_| "./data/media".to_string());
    let store = Arc::new(FileStore::new(&media_root, config.attachment_upload_to.clone()));
    eprintln!("   Attachments: {media_root}");

    // ── Backends ─────────────────────────────────────────────────────────
    // The default alias resolves to the active outbox configuration.
    let mut backends = BackendRegistry::new();
    if std::env::var("MAIL_GATEWAY_LOCMEM").is_ok_and(|v| v == "1" || v == "true") {
        backends.register("locmem", Arc::new(LocmemBackend::new()));
    }
    eprintln!("   Batch size: {}, lanes per process: {}, processes: {processes}", config.batch_size, config.threads_per_process);

    let engine = DispatchEngine::new(repo, store, backends, config);

    // Log delivery events as they happen
    let mut events = engine.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let GatewayEvent::EmailFailed { id, error } = event {
                tracing::warn!(email_id = %id, error = %error, "Delivery failed");
            }
        }
    });

    let Some(poll_secs) = poll_secs else {
        let report = engine.run_until_empty(processes, None).await?;
        eprintln!(
            "   Done: {} attempted, {} sent, {} failed",
            report.attempted, report.sent, report.failed
        );
        return Ok(());
    };

    eprintln!("   Polling every {poll_secs}s. Ctrl-C to stop.\n");
    let mut tick = tokio::time::interval(Duration::from_secs(poll_secs));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                match engine.run_until_empty(processes, None).await {
                    Ok(report) if !report.is_empty() => tracing::info!(
                        attempted = report.attempted,
                        sent = report.sent,
                        failed = report.failed,
                        "Queue drained"
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Dispatch run failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                return Ok(());
            }
        }
    }
}

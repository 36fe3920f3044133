use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use vcf_relay::channels::imap::ImapSmtpMailbox;
use vcf_relay::channels::{Channel, EmailConfig, FolderConfig, MailChannel, RemoteFolderChannel};
use vcf_relay::config::AppConfig;
use vcf_relay::engine::ReconciliationEngine;
use vcf_relay::routes::api_routes;
use vcf_relay::store::JobStore;
use vcf_relay::worker::{CompletionWatcher, spawn_reaper, spawn_watcher, stop_watchers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage.
    // Err only means another provider got there first.
    let _ = rustls::crypto::ring::default_provider().install_default();

    // A missing .env is fine; real env vars still apply.
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let app_config = AppConfig::from_env().context("invalid application config")?;

    eprintln!("📮 VCF Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Upload: POST http://0.0.0.0:{}/upload", app_config.port);
    eprintln!("   Result: GET  http://0.0.0.0:{}/result/{{id}}", app_config.port);

    let store = JobStore::new();
    let mut engine = ReconciliationEngine::new(Arc::clone(&store));
    // (channel, poll interval) in registration order; the first one is the fallback default.
    let mut active: Vec<(Arc<dyn Channel>, Duration)> = Vec::new();

    // ── Folder channel ──────────────────────────────────────────────────
    if let Some(folder_config) = FolderConfig::from_env().context("invalid folder channel config")? {
        let interval = Duration::from_secs(folder_config.poll_interval_secs);
        let channel: Arc<dyn Channel> = Arc::new(
            RemoteFolderChannel::from_config(folder_config)
                .context("failed to set up folder channel")?,
        );
        eprintln!("   Folder: enabled (poll every {}s)", interval.as_secs());
        active.push((channel, interval));
    } else {
        eprintln!("   Folder: disabled (set FOLDER_PATH or DRIVE_FOLDER_ID)");
    }

    // ── Mail channel ────────────────────────────────────────────────────
    if let Some(email_config) = EmailConfig::from_env().context("invalid email channel config")? {
        let interval = Duration::from_secs(email_config.poll_interval_secs);
        eprintln!(
            "   Mail: enabled (IMAP: {}, SMTP: {}, to: {}, poll every {}s)",
            email_config.imap_host,
            email_config.smtp_host,
            email_config.to_address,
            interval.as_secs()
        );
        let mailbox = Arc::new(ImapSmtpMailbox::new(email_config.clone()));
        let channel: Arc<dyn Channel> = Arc::new(
            MailChannel::from_config(&email_config, mailbox)
                .context("failed to set up mail channel")?,
        );
        active.push((channel, interval));
    } else {
        eprintln!("   Mail: disabled (set EMAIL_IMAP_HOST)");
    }

    let Some(first) = active.first().map(|(c, _)| c.kind()) else {
        anyhow::bail!("no channel configured: set FOLDER_PATH, DRIVE_FOLDER_ID or EMAIL_IMAP_HOST");
    };

    let default_channel = app_config.default_channel.unwrap_or(first);
    if !active.iter().any(|(c, _)| c.kind() == default_channel) {
        anyhow::bail!("DEFAULT_CHANNEL={default_channel} is not configured");
    }
    eprintln!("   Default channel: {default_channel}");

    // ── Watchers ────────────────────────────────────────────────────────
    let mut watchers = Vec::new();
    for (channel, interval) in active {
        engine = engine.with_channel(Arc::clone(&channel));
        let watcher = CompletionWatcher::new(channel, Arc::clone(&store));
        watchers.push(spawn_watcher(watcher, interval));
    }

    let reaper_handle = match app_config.job_max_age {
        Some(max_age) => {
            eprintln!("   Job expiry: after {}s", max_age.as_secs());
            Some(spawn_reaper(
                Arc::clone(&store),
                max_age,
                app_config.reaper_interval,
            ))
        }
        None => {
            eprintln!("   Job expiry: disabled");
            None
        }
    };
    eprintln!();

    // ── HTTP server ─────────────────────────────────────────────────────
    let app = api_routes(Arc::new(engine), default_channel, app_config.upload_max_bytes);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", app_config.port))
        .await
        .with_context(|| format!("failed to bind port {}", app_config.port))?;
    tracing::info!(port = app_config.port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("HTTP server error")?;

    stop_watchers(watchers).await;
    if let Some(handle) = reaper_handle {
        handle.abort();
    }
    tracing::info!("Watchers stopped");

    Ok(())
}

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use mailwarden::actions::apply::spawn_token_purge_task;
use mailwarden::actions::{AppState, ApplyOrchestrator, ApprovalService, action_routes};
use mailwarden::config::AppConfig;
use mailwarden::error::Result as AppResult;
use mailwarden::gateway::{ImapGateway, MailboxGateway, Timeouts, UnconfiguredGateway};
use mailwarden::safety::{ErrorSanitizer, LeakDetector};
use mailwarden::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = load_config().context("Invalid configuration")?;

    // Initialize tracing; the guard flushes the file writer on exit
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level));
    let (file_layer, _log_guard) = match &config.server.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .context("MAILWARDEN_LOG_FILE must name a file")?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("📬 Mailwarden v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://{}/api/pending-actions", config.server.bind);
    eprintln!(
        "   Safe mode: {}",
        if config.policy.safe_mode { "ON (no mailbox changes)" } else { "off" }
    );
    eprintln!(
        "   Destructive ops: {}",
        if config.policy.allow_destructive { "allowed" } else { "blocked" }
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db = open_store(&config.server.db_path)
        .await
        .with_context(|| format!("Failed to open database at {}", config.server.db_path.display()))?;
    eprintln!("   Database: {}", config.server.db_path.display());

    // ── Error sanitizer ──────────────────────────────────────────────────
    let secrets = config.mailbox.iter().flat_map(|m| m.credentials());
    let sanitizer = Arc::new(ErrorSanitizer::new(
        config.policy.verbose_errors,
        LeakDetector::new().with_secrets(secrets),
    ));
    eprintln!(
        "   Errors: {}",
        if sanitizer.is_verbose() { "verbose (redacted)" } else { "kinds only" }
    );

    // ── Mailbox gateway ──────────────────────────────────────────────────
    let (gateway, timeouts) = match &config.mailbox {
        Some(mailbox) => {
            eprintln!("   Mailbox: {}:{} ({})", mailbox.host, mailbox.port, mailbox.inbox);
            let timeouts = Timeouts {
                connect: mailbox.connect_timeout,
                operation: mailbox.operation_timeout,
            };
            let gateway: Arc<dyn MailboxGateway> = Arc::new(ImapGateway::new(mailbox.clone()));
            (gateway, timeouts)
        }
        None => {
            eprintln!("   Mailbox: not configured (applies will report unavailable)");
            let gateway: Arc<dyn MailboxGateway> = Arc::new(UnconfiguredGateway);
            (gateway, Timeouts::default())
        }
    };

    // ── Services ─────────────────────────────────────────────────────────
    let approvals = Arc::new(ApprovalService::new(
        Arc::clone(&db),
        config.policy.clone(),
        config.proposals.clone(),
    ));
    let orchestrator = Arc::new(
        ApplyOrchestrator::new(Arc::clone(&db), gateway, config.policy.clone(), Arc::clone(&sanitizer))
            .with_timeouts(timeouts),
    );

    // Spawn token purge task (runs every 60s)
    let _purge_handle = spawn_token_purge_task(Arc::clone(&orchestrator));

    let app = action_routes(AppState {
        approvals,
        orchestrator,
        sanitizer,
    });

    let listener = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!(addr = %config.server.bind, "Mailwarden API server started");
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn load_config() -> AppResult<AppConfig> {
    Ok(AppConfig::from_env()?)
}

/// Open (or create) the database and bring its schema up to date.
async fn open_store(path: &std::path::Path) -> AppResult<Arc<dyn Database>> {
    let backend = LibSqlBackend::new_local(path).await?;
    Ok(Arc::new(backend))
}

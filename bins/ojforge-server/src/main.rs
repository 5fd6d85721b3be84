use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use ojforge_adapters::{mock::MockAdapter, Adapter, AdapterRegistry};
use ojforge_concurrency::GatePool;
use ojforge_engine::{EngineConfig, EventBus, PushSink, SubprocessToolchain, Toolchain};
use ojforge_llm::LlmPool;
use ojforge_models::{ConcurrencyConfig, ProgressEvent};
use ojforge_service::{AppState, AuthService, SystemService, TaskService};
use ojforge_storage::{CredentialCipher, Repository, SqliteRepository};
use ojforge_workspace::WorkspaceStore;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ojforge batch engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// SQLite database URL
    #[arg(long, default_value = "sqlite://ojforge.db?mode=rwc")]
    database_url: String,

    /// Root directory for per-problem workspaces
    #[arg(long, default_value = "workspace")]
    workspace_root: String,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Bootstrap admin account name
    #[arg(long, default_value = "admin")]
    admin_user: String,
}

/// Placeholder push sink until a transport attaches: progress events land
/// in the log.
struct LogSink;

#[async_trait]
impl PushSink for LogSink {
    async fn push(&self, event: ProgressEvent) -> bool {
        tracing::debug!(
            kind = ?event.kind,
            task_id = %event.task_id,
            problem_id = event.problem_id.as_deref().unwrap_or("-"),
            "progress"
        );
        true
    }

    async fn lagged(&self, missed: u64) {
        tracing::warn!(missed, "event sink lagged and was dropped");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting ojforge server");

    // Unrecoverable configuration problems fail fast with a non-zero exit.
    let secret = env::var("OJFORGE_SECRET")
        .context("OJFORGE_SECRET must be set (credential encryption key)")?;
    let admin_password = env::var("OJFORGE_ADMIN_PASSWORD").unwrap_or_else(|_| "changeme".into());

    let cipher = CredentialCipher::from_secret(&secret);
    let repo: Arc<dyn Repository> = Arc::new(
        SqliteRepository::connect(&args.database_url, cipher)
            .await
            .context("opening datastore")?,
    );

    let gates = GatePool::new(ConcurrencyConfig::default());
    let llm = LlmPool::new(
        Arc::clone(&gates),
        Arc::clone(&repo),
        Duration::from_secs(300),
    );

    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(MockAdapter::named("mock")) as Arc<dyn Adapter>);

    let engine_config = EngineConfig::default();
    let toolchain: Arc<dyn Toolchain> = Arc::new(SubprocessToolchain::new(
        engine_config.clone(),
        Arc::clone(&gates),
    ));

    let bus = EventBus::default();
    {
        let bus = bus.clone();
        tokio::spawn(async move { bus.forward_to(Arc::new(LogSink)).await });
    }

    let state = Arc::new(AppState {
        repo: Arc::clone(&repo),
        registry: Arc::new(registry),
        gates,
        llm,
        store: WorkspaceStore::new(&args.workspace_root),
        bus,
        engine_config,
        toolchain,
    });

    let system = SystemService::new(Arc::clone(&state));
    system
        .load_persisted_concurrency()
        .await
        .context("restoring concurrency limits")?;

    let auth = AuthService::new(Arc::clone(&repo));
    let admin_id = auth
        .ensure_user(&args.admin_user, &admin_password, true)
        .await
        .context("bootstrapping admin account")?;
    info!(admin_id, "admin account ready");

    let tasks = TaskService::new(Arc::clone(&state));
    info!(
        adapters = state.registry.summaries().len(),
        providers = system.providers_list().len(),
        "core initialized, waiting for transport bindings"
    );

    tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
    info!("shutdown signal received, draining");
    tasks.shutdown().await;
    info!("drained cleanly");
    Ok(())
}

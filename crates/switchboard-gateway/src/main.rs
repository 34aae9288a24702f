use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use switchboard_call::orchestrator::CallRuntime;
use switchboard_call::worker::Worker;
use switchboard_core::cancel::CancelScope;
use switchboard_core::config::{SwitchboardConfig, VISIBILITY_TIMEOUT_SECS};
use switchboard_core::flags::FlagService;
use switchboard_llm::driver::TieredDriver;
use switchboard_media::stt::HttpRecognizer;
use switchboard_media::tts::HttpSynthesizer;
use switchboard_queue::{BackgroundDispatcher, WorkQueue};
use switchboard_services::{
    HttpContentSafety, HttpDocumentSearch, HttpSmsSender, HttpTranslator,
};
use switchboard_store::flags_source::SqliteFlagSource;
use switchboard_store::{CallStore, LeaseManager};
use switchboard_tools::{ToolDeps, ToolRegistry};

mod app;
mod http;
mod outbox;

#[derive(Parser)]
#[command(name = "switchboard-gateway", about = "Voice claim-intake orchestrator")]
struct Cli {
    /// Path to switchboard.toml (falls back to SWITCHBOARD_CONFIG, then
    /// ~/.switchboard/switchboard.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboard=info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .or_else(|| std::env::var("SWITCHBOARD_CONFIG").ok());
    let config = SwitchboardConfig::load(config_path.as_deref())?;

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let runtime = build_runtime(&config)?;
    let state = Arc::new(app::AppState::new(
        config.clone(),
        runtime.store.clone(),
        runtime.queue.clone(),
    ));

    // Worker pool: each worker polls the queues and hosts call sessions.
    let worker_scope = CancelScope::root();
    let mut worker_tasks = Vec::new();
    for _ in 0..config.worker.pool_size {
        let worker = Worker::new(
            runtime.clone(),
            config.conversation.clone(),
            Duration::from_millis(config.worker.poll_interval_ms),
            Duration::from_secs(config.worker.drain_deadline_secs),
        );
        let scope = worker_scope.clone();
        worker_tasks.push(tokio::spawn(async move { worker.run(scope).await }));
    }

    let router = app::build_router(state);
    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    info!("switchboard gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown_scope = worker_scope.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("ctrl-c handler unavailable");
            }
            info!("shutdown requested, draining workers");
            shutdown_scope.cancel();
        })
        .await?;

    for task in worker_tasks {
        let _ = task.await;
    }
    info!("gateway stopped");
    Ok(())
}

fn build_runtime(config: &SwitchboardConfig) -> anyhow::Result<Arc<CallRuntime>> {
    let db = config.database.path.as_str();
    let store = Arc::new(CallStore::open(db)?);
    let leases = Arc::new(LeaseManager::open(db)?);
    let queue = Arc::new(WorkQueue::open(
        db,
        Duration::from_secs(VISIBILITY_TIMEOUT_SECS),
    )?);
    let dispatcher = Arc::new(BackgroundDispatcher::new(
        queue.clone(),
        rusqlite::Connection::open(db)?,
    )?);
    let flags = Arc::new(FlagService::new(Arc::new(SqliteFlagSource::open(db)?)));

    let driver = Arc::new(TieredDriver::from_config(&config.llm));
    let registry = Arc::new(ToolRegistry::builtin());

    let translator = config
        .services
        .translate
        .clone()
        .map(|cfg| Arc::new(HttpTranslator::new(cfg)) as Arc<dyn switchboard_services::Translator>);
    let safety = config.services.safety.clone().map(|cfg| {
        Arc::new(HttpContentSafety::new(cfg)) as Arc<dyn switchboard_services::ContentSafety>
    });
    let search = config.services.search.clone().map(|cfg| {
        Arc::new(HttpDocumentSearch::new(cfg)) as Arc<dyn switchboard_services::DocumentSearch>
    });
    let sms = config
        .services
        .sms
        .clone()
        .map(|cfg| Arc::new(HttpSmsSender::new(cfg)) as Arc<dyn switchboard_services::SmsSender>);

    let startup_flags = flags.snapshot();
    let recognizer = Arc::new(HttpRecognizer::new(
        config.media.stt_endpoint.clone(),
        config.media.api_key.clone(),
        startup_flags.recognition_retry_max,
        startup_flags.vad_threshold,
    ));
    let synthesizer = Arc::new(HttpSynthesizer::new(
        config.media.tts_endpoint.clone(),
        config.media.api_key.clone(),
    ));

    Ok(Arc::new(CallRuntime {
        store,
        leases,
        queue,
        dispatcher,
        driver,
        registry,
        tool_deps: ToolDeps {
            search,
            sms: Arc::new(outbox::DirectSmsOutbox::new(sms)),
        },
        recognizer,
        synthesizer,
        translator,
        safety,
        flags,
        voice: config.media.voice.clone(),
        voice_styles: config.media.voice_styles.clone(),
        pivot_lang: switchboard_core::types::LangTag::new(&config.conversation.pivot_lang),
        context_chars: config.llm.fast.context_chars,
    }))
}

//! overseer — main entry point.
//!
//! Wires the coordination fabric together and serves the HTTP gateway.
//! The agent runtime is pluggable; until a real one is linked in, a
//! development echo runtime stands in so the whole pipeline (dispatch,
//! watchdogs, injection, SSE) can be exercised end to end.

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use overseer::agent::{
    Agent, AgentFactory, Completion, EventStream, MonitorEvent, StreamEvent,
};
use overseer::approval::{ApprovalManager, PermissionBridge};
use overseer::bus::EventBus;
use overseer::chat::ChatLock;
use overseer::config::Config;
use overseer::error::AgentError;
use overseer::history::HistoryStore;
use overseer::injection::InjectionQueue;
use overseer::progress::ProgressTracker;
use overseer::safety::CommandPolicy;
use overseer::sandbox::{NullSandboxFactory, SandboxKind, SandboxRegistry};
use overseer::scheduler::{RunnerDeps, TaskRunner};
use overseer::server::{self, AppState};

#[derive(Parser, Debug)]
#[command(name = "overseer")]
#[command(about = "Background sub-task orchestrator with priority dispatch and result injection")]
#[command(version)]
struct Args {
    /// Bind host (overrides HTTP_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides HTTP_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bearer token for the API (overrides HTTP_AUTH_TOKEN; generated
    /// when neither is set)
    #[arg(long)]
    token: Option<String>,

    /// Create remote (isolated) sandboxes instead of local ones
    #[arg(long)]
    remote_sandbox: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("overseer=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    tracing::info!("Starting overseer...");

    let mut config = Config::from_env()?;
    if let Some(host) = args.host {
        config.http.host = host;
    }
    if let Some(port) = args.port {
        config.http.port = port;
    }
    if let Some(token) = args.token {
        config.http.auth_token = Some(token);
    }

    let auth_token = config.http.auth_token.clone().unwrap_or_else(|| {
        let token = Uuid::new_v4().to_string();
        tracing::info!("No auth token configured; generated one: {}", token);
        token
    });

    let bus = EventBus::default();
    let approvals = Arc::new(ApprovalManager::new());
    let bridge = Arc::new(PermissionBridge::new(
        Arc::clone(&approvals),
        CommandPolicy::new(&config.policy),
        bus.clone(),
    ));
    let progress = Arc::new(ProgressTracker::new(config.progress.interval, bus.clone()));
    let registry = Arc::new(SandboxRegistry::new());

    let sandbox_kind = if args.remote_sandbox {
        SandboxKind::Remote
    } else {
        SandboxKind::Local
    };

    let runner = TaskRunner::new(
        config.scheduler.clone(),
        config.keep_alive.clone(),
        config.injection.clone(),
        RunnerDeps {
            agent_factory: Arc::new(EchoRuntimeFactory),
            sandbox_factory: Arc::new(NullSandboxFactory),
            sandbox_kind,
            registry,
            bridge,
            bus: bus.clone(),
            progress: Arc::clone(&progress),
        },
    );

    let parent: Arc<dyn Agent> = Arc::new(EchoRuntime::new("orchestrator"));
    let chat_lock = Arc::new(ChatLock::new());
    let history = Arc::new(HistoryStore::new());
    let injector = InjectionQueue::new(
        Arc::clone(&parent),
        bus.clone(),
        Arc::clone(&chat_lock),
        Arc::clone(&history),
    );
    runner.set_injector(Arc::clone(&injector));

    tracing::info!(
        max_concurrent = config.scheduler.max_concurrent,
        sandbox_kind = %sandbox_kind,
        "Runner wired"
    );

    let state = AppState {
        runner,
        parent,
        chat_lock,
        bus,
        approvals,
        progress,
        history,
        injector,
        auth_token,
    };

    server::serve(state, &config.http.host, config.http.port).await
}

/// Development stand-in for the agent runtime: completes by echoing its
/// input, streams a one-chunk reply, emits no monitor events.
struct EchoRuntime {
    label: String,
}

impl EchoRuntime {
    fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl Agent for EchoRuntime {
    async fn complete(&self, input: &str) -> Result<Completion, AgentError> {
        Ok(Completion::ok(format!("[{} echo] {}", self.label, input)))
    }

    async fn chat_stream(&self, input: &str) -> Result<EventStream, AgentError> {
        let events = vec![
            StreamEvent::TextChunkStart,
            StreamEvent::TextChunk {
                delta: format!("[{} echo] {}", self.label, input),
            },
            StreamEvent::Done { reason: None },
        ];
        Ok(Box::pin(futures::stream::iter(events)))
    }

    async fn interrupt(&self, _note: Option<&str>) {}

    fn subscribe(&self) -> mpsc::UnboundedReceiver<MonitorEvent> {
        let (_tx, rx) = mpsc::unbounded_channel();
        rx
    }
}

struct EchoRuntimeFactory;

#[async_trait]
impl AgentFactory for EchoRuntimeFactory {
    async fn create(
        &self,
        template_id: &str,
        _skills: &[String],
    ) -> Result<Arc<dyn Agent>, AgentError> {
        Ok(Arc::new(EchoRuntime::new(template_id)))
    }
}

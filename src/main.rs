mod collaborators;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use harvest_core::config::{AppConfig, EngineKind};
use harvest_core::event::EventBus;
use harvest_core::types::{kinds, Task};

use harvest_agent::{
    CachedController, Collaborators, MessageBus, MultiWorkerWorkflow, Pipeline, RunJournal,
    RunParams, Supervisor, WorkerHost, WorkerPool,
};

use collaborators::{JsonFeedSource, LogNotifier, MemoryStore, NormalizingParser};

#[derive(Parser)]
#[command(name = "harvest", version, about = "Multi-worker content harvesting")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "harvest.toml")]
    config: PathBuf,

    /// JSON feed standing in for the crawled site
    #[arg(short, long, default_value = "feed.json")]
    feed: PathBuf,

    /// Workflow strategy (graph or sequential); overrides the config
    #[arg(short, long)]
    engine: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the multi-worker workflow under the supervisor
    Run {
        /// Target URL; overrides [target].url
        #[arg(long)]
        url: Option<String>,
        /// Comma-separated keywords; overrides [target].keywords
        #[arg(long, value_delimiter = ',')]
        keywords: Vec<String>,
        /// Wrap the run in the adaptive loop
        #[arg(long)]
        adaptive: bool,
    },
    /// Run the primary crawl/parse/store/notify pipeline
    Pipeline {
        #[arg(long)]
        url: Option<String>,
    },
    /// Show current configuration
    Config,
}

fn parse_engine(name: &str) -> anyhow::Result<EngineKind> {
    match name {
        "graph" => Ok(EngineKind::Graph),
        "sequential" => Ok(EngineKind::Sequential),
        other => bail!("unknown engine '{other}' (expected graph or sequential)"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("harvest=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "No config file found, using defaults");
        AppConfig::default()
    };
    if let Some(name) = &cli.engine {
        config.workflow.engine = parse_engine(name)?;
    }

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Run {
            url,
            keywords,
            adaptive,
        } => {
            let session = Session::start(&config);
            let collab = collaborators(&cli.feed);
            let outcome = run_multi(
                &config,
                &collab,
                session.events.clone(),
                url,
                keywords,
                adaptive,
            )
            .await;
            session.finish().await;
            println!("{}", serde_json::to_string_pretty(&outcome?)?);
        }
        Commands::Pipeline { url } => {
            let session = Session::start(&config);
            let collab = collaborators(&cli.feed);
            let url = url.unwrap_or_else(|| config.target.url.clone());
            let outcome = run_pipeline(&config, &collab, session.events.clone(), &url).await;
            session.finish().await;
            println!("{}", serde_json::to_string_pretty(&outcome?)?);
        }
    }
    Ok(())
}

/// Event bus plus the optional journal writing it to disk.
struct Session {
    events: Arc<EventBus>,
    cancel: CancellationToken,
    journal: Option<JoinHandle<()>>,
}

impl Session {
    fn start(config: &AppConfig) -> Self {
        let events = Arc::new(EventBus::new(config.workflow.event_capacity));
        let cancel = CancellationToken::new();
        let journal = match &config.journal {
            Some(journal) if journal.enabled => {
                let journal = RunJournal::new(journal.resolved_dir());
                info!(path = %journal.path().display(), "Journaling workflow events");
                Some(journal.spawn(&events, cancel.clone()))
            }
            _ => None,
        };
        Self {
            events,
            cancel,
            journal,
        }
    }

    async fn finish(self) {
        self.cancel.cancel();
        if let Some(handle) = self.journal {
            handle.await.ok();
        }
    }
}

fn collaborators(feed: &Path) -> Collaborators {
    Collaborators::new(
        Arc::new(JsonFeedSource::new(feed.to_path_buf())),
        Arc::new(NormalizingParser),
        Arc::new(MemoryStore::default()),
        Arc::new(LogNotifier),
    )
}

async fn run_pipeline(
    config: &AppConfig,
    collab: &Collaborators,
    events: Arc<EventBus>,
    url: &str,
) -> anyhow::Result<serde_json::Value> {
    let pipeline = Pipeline::new(
        collab,
        config.workflow.engine,
        events,
        config.workflow.max_node_visits,
    )?;
    let outcome = pipeline.run(url).await?;
    serde_json::to_value(&outcome).context("serializing pipeline outcome")
}

async fn run_multi(
    config: &AppConfig,
    collab: &Collaborators,
    events: Arc<EventBus>,
    url: Option<String>,
    keywords: Vec<String>,
    adaptive: bool,
) -> anyhow::Result<serde_json::Value> {
    let mut params = RunParams::from(&config.target);
    if let Some(url) = url {
        params.url = url;
    }
    if !keywords.is_empty() {
        params.keywords = keywords;
    }
    if params.url.is_empty() {
        bail!("no target url: pass --url or set [target].url");
    }

    let pool = Arc::new(WorkerPool::standard(collab, &config.workers));
    let workflow = Arc::new(MultiWorkerWorkflow::new(
        pool,
        collab,
        config.workflow.engine,
        events,
        config.workflow.max_node_visits,
    )?);

    if adaptive || config.adaptive.enabled {
        let controller = CachedController::new(workflow, &config.adaptive);
        let report = controller.run(params).await;
        return serde_json::to_value(&report).context("serializing adaptive report");
    }

    let bus = Arc::new(MessageBus::with_config(&config.bus));
    let supervisor = Arc::new(
        Supervisor::new(workflow, bus)
            .with_timeout(config.workers.supervisor_timeout_secs),
    );
    supervisor.register_all().await;
    let host = WorkerHost::new(supervisor.clone())
        .with_history_capacity(config.workers.history_capacity);

    let task = Task::new(kinds::COORDINATE, params.to_params());
    let result = host.receive(task).await;
    supervisor.shutdown().await;
    host.shutdown();

    if !result.success {
        bail!(
            "workflow failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    serde_json::to_value(&result).context("serializing supervisor result")
}

use anyhow::Result;
use blockflow::block::BlockRegistry;
use blockflow::cli::{self, OutputEvent, OutputMode, commands};
use blockflow::config::EngineConfig;
use blockflow::logging;
use blockflow::workflow::FlowRunner;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "blockflow")]
#[command(about = "Flow execution engine - walk block graphs with pause/resume")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory for `.blockflow/config.toml` (defaults to current)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Extra config file, applied after user and project config
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Suppress normal output
    #[arg(long, global = true)]
    quiet: bool,

    /// Emit events as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Also write logs to a file (default location if no path is given)
    #[arg(long, global = true, num_args = 0..=1)]
    log_file: Option<Option<PathBuf>>,
}

impl Cli {
    fn flow_path(&self) -> Option<&PathBuf> {
        match &self.command {
            Commands::Run { flow, .. }
            | Commands::Resume { flow, .. }
            | Commands::Validate { flow } => Some(flow),
            Commands::Blocks => None,
        }
    }

    fn log_path(&self) -> Result<Option<PathBuf>> {
        match &self.log_file {
            None => Ok(None),
            Some(Some(path)) => Ok(Some(path.clone())),
            Some(None) => {
                let stem = self
                    .flow_path()
                    .and_then(|p| p.file_stem())
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                Ok(Some(logging::default_log_path(&stem)?))
            }
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Begin a new run of a flow
    Run {
        /// Flow version file (.json or .toml)
        flow: PathBuf,

        /// Trigger payload as JSON
        #[arg(long)]
        payload: Option<String>,

        /// Write the resulting execution context here
        #[arg(long)]
        state_out: Option<PathBuf>,
    },

    /// Resume a paused run
    Resume {
        /// Flow version file (.json or .toml)
        flow: PathBuf,

        /// Execution context saved by a previous run
        #[arg(long)]
        state: PathBuf,

        /// Query parameter for the paused step (key=value, repeatable)
        #[arg(long = "query")]
        query: Vec<String>,

        /// Request body for the paused step as JSON
        #[arg(long)]
        body: Option<String>,

        /// Write the resulting execution context here
        #[arg(long)]
        state_out: Option<PathBuf>,
    },

    /// Validate a flow without running it
    Validate {
        /// Flow version file (.json or .toml)
        flow: PathBuf,
    },

    /// List registered block actions
    Blocks,
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = EngineConfig::load(cli.dir.as_deref())?;
    if let Some(path) = &cli.config {
        config.merge(EngineConfig::load_file(path)?);
    }
    Ok(config)
}

async fn dispatch(cli: Cli, handler: &dyn cli::OutputHandler) -> Result<i32> {
    let config = Arc::new(load_config(&cli)?);
    let registry = Arc::new(BlockRegistry::with_core_blocks());
    let runner = FlowRunner::new(Arc::clone(&registry), config);

    match cli.command {
        Commands::Run {
            flow,
            payload,
            state_out,
        } => {
            let payload = payload
                .as_deref()
                .map(commands::parse_json_arg)
                .unwrap_or(Value::Null);
            commands::run_flow(&runner, &flow, payload, state_out.as_deref(), handler).await
        }
        Commands::Resume {
            flow,
            state,
            query,
            body,
            state_out,
        } => {
            let body = body.as_deref().map(commands::parse_json_arg);
            commands::resume_flow(
                &runner,
                &flow,
                &state,
                &query,
                body,
                state_out.as_deref(),
                handler,
            )
            .await
        }
        Commands::Validate { flow } => commands::validate_flow(&flow, &registry, handler),
        Commands::Blocks => {
            commands::list_blocks(&registry, handler);
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_logging(cli.debug, cli.quiet || cli.json, cli.log_path()?)?;

    let handler = cli::create_handler(OutputMode::from_flags(cli.json, cli.quiet), cli.debug);

    let code = match dispatch(cli, &*handler).await {
        Ok(code) => code,
        Err(e) => {
            handler.emit(OutputEvent::Error {
                error: format!("{:#}", e),
            });
            1
        }
    };

    std::process::exit(code);
}

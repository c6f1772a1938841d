use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use storyline_rs::sdk::task::{FnTask, TaskOutcome};
use storyline_rs::storyline::builder::GraphBuilder;
use storyline_rs::storyline::condition::ConditionRegistry;
use storyline_rs::storyline::config::EngineConfig;
use storyline_rs::storyline::engine::{StoryEngine, StoryRequest};
use storyline_rs::storyline::loader::StoryLoader;
use storyline_rs::storyline::preheat::{PreheatContext, PreheatPipeline};
use storyline_rs::storyline::registry::TaskRegistry;
use storyline_rs::storyline::role::Role;
use storyline_rs::storyline::server;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration file (YAML); environment variables otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load and preheat a story file, then print its shape
    Check {
        /// Path to the story file
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Fire a story once
    Run {
        /// Path to the story file
        #[arg(short, long)]
        file: PathBuf,

        /// Request input as JSON
        #[arg(short, long, default_value = "{}")]
        input: String,

        /// Comma separated permissions of the caller
        #[arg(short, long)]
        role: Option<String>,
    },
    /// Serve every story of a directory over HTTP
    Serve {
        /// Directory of story files
        #[arg(short, long, default_value = "stories")]
        dir: PathBuf,

        #[arg(short, long, default_value_t = 3000)]
        port: u16,
    },
}

/// Services available to stories started from the command line
async fn default_registry() -> TaskRegistry {
    let registry = TaskRegistry::with_builtin_instructs().await;
    registry
        .register(Arc::new(FnTask::new("echo", |request| {
            Ok(TaskOutcome::Value(Value::Object(request.params)))
        })))
        .await;
    registry
        .register(Arc::new(FnTask::new("noop", |_| Ok(TaskOutcome::Empty))))
        .await;
    registry
}

fn engine_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load engine config {}", path.display())),
        None => Ok(EngineConfig::from_env()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let config = engine_config(args.config.as_ref())?;

    match args.command {
        Commands::Check { file } => {
            let def = StoryLoader::new()
                .load_story(&file)
                .with_context(|| format!("Failed to load {}", file.display()))?;
            let graph = GraphBuilder::build(&def)?;
            let context = PreheatContext::new(ConditionRegistry::new());
            let graph = PreheatPipeline::new().run(graph, &context)?;

            println!("Story '{}' is valid", graph.id);
            for node in graph.nodes() {
                println!(
                    "  {:<24} {:<18} in={} out={}",
                    node.id,
                    node.kind.name(),
                    node.incoming().len(),
                    node.outgoing().len()
                );
            }
        }
        Commands::Run { file, input, role } => {
            let def = StoryLoader::new()
                .load_story(&file)
                .with_context(|| format!("Failed to load {}", file.display()))?;
            let req: Value = serde_json::from_str(&input).context("Input must be JSON")?;

            let engine = StoryEngine::new(config, default_registry().await);
            engine.register_story(&def).await?;

            let mut request = StoryRequest::new(&def.id, req);
            if let Some(role) = role {
                request = request.with_role(Role::new(
                    role.split(',').map(str::trim).filter(|p| !p.is_empty()),
                ));
            }

            let result = engine.fire(request).await?;
            println!("{}", serde_json::to_string_pretty(&result.to_json())?);
            if !result.is_success() {
                anyhow::bail!("Story '{}' finished with {:?}", def.id, result.status);
            }
        }
        Commands::Serve { dir, port } => {
            let engine = StoryEngine::new(config, default_registry().await);
            for def in StoryLoader::new().load_dir(&dir)? {
                if let Err(e) = engine.register_story(&def).await {
                    log::warn!("Skipping story '{}': {}", def.id, e);
                }
            }
            server::serve(Arc::new(engine), port)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
        }
    }

    Ok(())
}

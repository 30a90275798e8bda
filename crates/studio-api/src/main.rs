//! Studio workflow engine entry point.
//!
//! Binary name: `studio`
//!
//! Parses CLI arguments, initializes the database and engine services, then
//! either starts the REST API server or runs an agent management command.

mod http;
mod state;

use clap::{Parser, Subcommand};

use state::AppState;
use studio_types::agent::AgentConfig;

#[derive(Parser)]
#[command(name = "studio", version, about = "Durable multi-agent workflow engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API server and event channel.
    Serve {
        /// Address to bind.
        #[arg(long, default_value = "127.0.0.1:3456", env = "STUDIO_BIND")]
        bind: String,
        /// Enable OpenTelemetry trace export.
        #[arg(long)]
        otel: bool,
    },
    /// Manage agent configurations.
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
}

#[derive(Subcommand)]
enum AgentCommands {
    /// Register (or update) an agent.
    Add {
        /// Agent id (case-sensitive).
        #[arg(long)]
        id: String,
        /// Role for case-insensitive resolution.
        #[arg(long)]
        role: String,
        /// System prompt text.
        #[arg(long)]
        system_prompt: String,
        /// Model identifier.
        #[arg(long, default_value = "claude-sonnet-4-20250514")]
        model: String,
        /// Project scope; omit for the global registry.
        #[arg(long)]
        project: Option<String>,
        #[arg(long, default_value_t = 8192)]
        max_tokens: u32,
        #[arg(long, default_value_t = 0.7)]
        temperature: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; -v flags set the floor otherwise.
    let directives = match cli.verbose {
        0 => "info",
        1 => "info,studio_core=debug,studio_api=debug",
        _ => "trace",
    };

    match cli.command {
        Commands::Serve { bind, otel } => {
            studio_observe::tracing_setup::init_tracing(directives, otel)
                .map_err(|e| anyhow::anyhow!("tracing init failed: {e}"))?;

            let state = AppState::init().await?;
            state.spawn_background_tasks();

            let data_dir = state.data_dir.clone();
            let router = http::router::build_router(state);
            let listener = tokio::net::TcpListener::bind(&bind).await?;
            tracing::info!(
                bind = bind.as_str(),
                data_dir = %data_dir.display(),
                "studio listening"
            );
            axum::serve(listener, router).await?;

            studio_observe::tracing_setup::shutdown_tracing();
        }
        Commands::Agent { command } => {
            studio_observe::tracing_setup::init_tracing(directives, false)
                .map_err(|e| anyhow::anyhow!("tracing init failed: {e}"))?;

            match command {
                AgentCommands::Add {
                    id,
                    role,
                    system_prompt,
                    model,
                    project,
                    max_tokens,
                    temperature,
                } => {
                    let data_dir = studio_infra::resolve_data_dir();
                    tokio::fs::create_dir_all(&data_dir).await?;
                    let db_url = format!(
                        "sqlite://{}?mode=rwc",
                        data_dir.join("studio.db").display()
                    );
                    let pool = studio_infra::sqlite::pool::DatabasePool::new(&db_url).await?;
                    let directory = studio_infra::sqlite::agent::SqliteAgentDirectory::new(pool);

                    let config = AgentConfig {
                        id: id.clone(),
                        name: role.clone(),
                        role,
                        system_prompt,
                        model,
                        tools: Vec::new(),
                        max_tokens,
                        temperature,
                    };
                    directory
                        .upsert(project.as_deref(), &config)
                        .await
                        .map_err(|e| anyhow::anyhow!("failed to save agent: {e}"))?;
                    println!("agent '{id}' saved");
                }
            }
        }
    }

    Ok(())
}

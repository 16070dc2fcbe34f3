mod auth_cmd;
mod cancel_cmd;
mod config;
mod http_client;
mod serve_cmd;
mod status_cmd;
mod submit_cmd;
#[cfg(test)]
mod test_util;
mod usage_cmd;
mod worker_listener;

use anyhow::Context;
use clap::{Parser, Subcommand};

use config::MarathonConfig;
use http_client::CliError;

#[derive(Parser)]
#[command(name = "marathon", about = "Distributed execution system for autonomous coding-agent tasks")]
struct Cli {
    /// Orchestrator gateway address (overrides MARATHON_ORCHESTRATOR_ADDRESS / config file)
    #[arg(long, global = true)]
    address: Option<String>,
    /// Orchestrator gateway port (overrides MARATHON_ORCHESTRATOR_PORT / config file)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a marathon config file with freshly generated secrets (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/marathon")]
        db_url: String,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the orchestrator: node registry, scheduler, event bus, worker listener, HTTP gateway
    Serve,
    /// Create a user account and store the issued bearer token locally
    Register {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
    /// Log in and store the issued bearer token locally
    Login {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
    /// Submit a task for execution
    Submit {
        /// Git repository URL to check out
        #[arg(long)]
        repo: String,
        /// Branch to check out
        #[arg(long, default_value = "main")]
        branch: String,
        /// Prompt describing the work the agent should do
        #[arg(long)]
        prompt: String,
        /// Open a pull request on success
        #[arg(long)]
        pr: bool,
        /// Title for the pull request (only used with --pr)
        #[arg(long)]
        pr_title: Option<String>,
        /// Body for the pull request (only used with --pr)
        #[arg(long)]
        pr_body: Option<String>,
        /// Environment variable forwarded to the worker, KEY=VALUE (repeatable)
        #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Maximum agent iterations before the task is abandoned
        #[arg(long, default_value_t = 50)]
        max_iterations: u32,
        /// Opaque string forwarded to the agent runtime, uninterpreted here
        #[arg(long)]
        completion_promise: Option<String>,
        /// Stream task lifecycle events to stdout until a terminal state is reached
        #[arg(short = 'f', long)]
        follow: bool,
    },
    /// Show a task's detail, or list every task the caller owns
    Status {
        /// Task ID to show (omit to list all of the caller's tasks)
        task_id: Option<String>,
        /// When listing, restrict to tasks in this state
        #[arg(long)]
        state: Option<String>,
    },
    /// Cancel a task (idempotent: cancelling an already-terminal task is a no-op)
    Cancel {
        /// Task ID to cancel
        task_id: String,
    },
    /// Show the caller's rolling token/compute usage totals
    Usage,
}

/// Execute `marathon init`: write the config file with freshly generated secrets.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!("config file already exists at {}\nUse --force to overwrite.", path.display());
    }

    let jwt_secret = config::generate_secret();
    let node_auth_key = config::generate_secret();

    let cfg = config::ConfigFile {
        orchestrator: config::OrchestratorSection {
            address: "127.0.0.1".to_string(),
            port: 8420,
            worker_port: 8421,
        },
        database: config::DatabaseSection { url: db_url.to_string() },
        auth: config::AuthSection { jwt_secret: jwt_secret.clone(), node_auth_key: node_auth_key.clone() },
        tls: config::TlsSection::default(),
        session: config::SessionSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  orchestrator = {}:{}", cfg.orchestrator.address, cfg.orchestrator.port);
    println!("  auth.jwt_secret = {}...{}", &jwt_secret[..8], &jwt_secret[56..]);
    println!("  auth.node_auth_key = {}...{}", &node_auth_key[..8], &node_auth_key[56..]);
    println!();
    println!("Next: run `marathon serve` to start the orchestrator, then `marathon register --username ... --password ...`.");

    Ok(())
}

/// Map a [`CliError`] onto its §6 exit code, printing the message to stderr.
fn exit_for(err: CliError) -> ! {
    eprintln!("{err}");
    std::process::exit(err.exit_code);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let address = cli.address.as_deref();
    let port = cli.port;

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::Serve => {
            let config = MarathonConfig::resolve(address, port, None).context("failed to resolve marathon configuration")?;
            serve_cmd::run(&config).await?;
        }
        Commands::Register { username, password } => {
            if let Err(e) = auth_cmd::run_register(address, port, &username, &password).await {
                exit_for(e);
            }
        }
        Commands::Login { username, password } => {
            if let Err(e) = auth_cmd::run_login(address, port, &username, &password).await {
                exit_for(e);
            }
        }
        Commands::Submit { repo, branch, prompt, pr, pr_title, pr_body, env, max_iterations, completion_promise, follow } => {
            let args = submit_cmd::SubmitArgs {
                repo,
                branch,
                prompt,
                create_pr: pr,
                pr_title,
                pr_body,
                env,
                max_iterations,
                completion_promise,
                follow,
            };
            if let Err(e) = submit_cmd::run(address, port, args).await {
                exit_for(e);
            }
        }
        Commands::Status { task_id, state } => {
            if let Err(e) = status_cmd::run(address, port, task_id, state).await {
                exit_for(e);
            }
        }
        Commands::Cancel { task_id } => {
            if let Err(e) = cancel_cmd::run(address, port, &task_id).await {
                exit_for(e);
            }
        }
        Commands::Usage => {
            if let Err(e) = usage_cmd::run(address, port).await {
                exit_for(e);
            }
        }
    }

    Ok(())
}

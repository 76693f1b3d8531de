//! nest CLI: run the controller and task agents.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use wasp_nest::command::{
    Command, CommandRegistry, Download, Execute, FileList, OutputEncoding, Proxy,
};
use wasp_nest::config::{ConfigError, ControllerConfig};
use wasp_nest::operator::Operator;
use wasp_nest::paths::NestPaths;
use wasp_nest::protocol::Envelope;
use wasp_nest::server::Controller;
use wasp_nest::store::AgentStore;

#[derive(Parser)]
#[command(name = "nest", version, about = "Controller for Wasp agents")]
struct Cli {
    /// Data directory holding agent records, queues and collections.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (default: $XDG_CONFIG_HOME/wasp-nest/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept agent connections and drain their queues.
    Serve {
        /// Address to bind (overrides NEST_BIND and the config file).
        #[arg(long)]
        bind: Option<String>,

        /// Port to listen on (overrides NEST_PORT and the config file).
        #[arg(long)]
        port: Option<u16>,
    },

    /// List known agents.
    Agents,

    /// Show an agent's pending tasks.
    Queue {
        #[arg(long, short)]
        agent: String,
    },

    /// Queue a command line for execution.
    Exec {
        #[arg(long, short)]
        agent: String,

        /// Command line run by the agent.
        command_line: String,
    },

    /// Queue a file download.
    Download {
        #[arg(long, short)]
        agent: String,

        /// Path on the agent's host.
        path: String,

        #[arg(long, default_value = "0")]
        begin: u64,

        #[arg(long, default_value = "1024")]
        end: u64,

        /// Ask the agent not to resume partial transfers.
        #[arg(long)]
        no_break_point: bool,
    },

    /// Queue a directory listing.
    Ls {
        #[arg(long, short)]
        agent: String,

        path: String,
    },

    /// Queue a reverse tunnel request.
    Proxy {
        #[arg(long, short)]
        agent: String,

        /// Port on this host the agent connects back to.
        #[arg(long)]
        reverse_port: u16,

        #[arg(long)]
        dest_host: String,

        #[arg(long)]
        dest_port: u16,
    },

    /// Queue a task given as a JSON envelope, e.g.
    /// '{"uri":"filelist","headers":{"File-Path":"/tmp"}}'.
    Task {
        #[arg(long, short)]
        agent: String,

        envelope: String,
    },

    /// Print an agent's response log.
    Responses {
        #[arg(long, short)]
        agent: String,
    },

    /// Manage the config file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a config file with every default spelled out.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut paths = NestPaths::resolve()?;
    if let Some(dir) = &cli.data_dir {
        paths = paths.with_data_dir(dir);
    }
    let config_file = cli.config.clone().unwrap_or_else(|| paths.config_file());

    let open_store = || AgentStore::open(paths.clone(), Arc::new(CommandRegistry::with_builtins()));

    match cli.command {
        Commands::Serve { bind, port } => {
            let mut config = ControllerConfig::load_or_default(&config_file)?;
            apply_env_overrides(&mut config)?;
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(port) = port {
                config.port = port;
            }
            config.validate()?;

            let controller = Controller::new(config, open_store()?);
            let listener = controller.bind().await.into_diagnostic()?;

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, shutting down");
                    let _ = shutdown_tx.send(true);
                }
            });

            let report = controller.serve(listener, shutdown_rx).await;
            if report.cancelled > 0 {
                println!("{} session(s) did not finish within the grace period.", report.cancelled);
            }
        }

        Commands::Agents => {
            let agents = open_store()?.list_agents()?;
            if agents.is_empty() {
                println!("No agents yet.");
            }
            for agent in agents {
                println!("{agent}");
            }
        }

        Commands::Queue { agent } => {
            let operator = select(open_store()?, &agent)?;
            let pending = operator.pending_tasks()?;
            if pending.is_empty() {
                println!("No pending tasks for {agent}.");
            }
            for (i, task) in pending.iter().enumerate() {
                println!("{:>3}. {task}", i + 1);
            }
        }

        Commands::Exec {
            agent,
            command_line,
        } => {
            submit(open_store()?, &agent, Command::new(Execute::new(command_line)))?;
        }

        Commands::Download {
            agent,
            path,
            begin,
            end,
            no_break_point,
        } => {
            let download = Download::new(path)
                .with_range(begin, end)
                .with_break_point(!no_break_point);
            submit(open_store()?, &agent, Command::new(download))?;
        }

        Commands::Ls { agent, path } => {
            submit(open_store()?, &agent, Command::new(FileList::new(path)))?;
        }

        Commands::Proxy {
            agent,
            reverse_port,
            dest_host,
            dest_port,
        } => {
            let proxy = Proxy::new(reverse_port, dest_host, dest_port);
            submit(open_store()?, &agent, Command::new(proxy))?;
        }

        Commands::Task { agent, envelope } => {
            let envelope = Envelope::from_slice(envelope.as_bytes())?;
            let operator = select(open_store()?, &agent)?;
            let command = operator.submit_envelope(&envelope)?;
            println!("Queued {} {} for {agent}", command.verb(), command.id());
        }

        Commands::Responses { agent } => {
            let operator = select(open_store()?, &agent)?;
            for response in operator.responses()? {
                let (text, encoding) = response.display_text();
                let verb = response.verb.as_deref().unwrap_or("unknown");
                let tag = match encoding {
                    OutputEncoding::Utf8 => "",
                    OutputEncoding::Base64 => " (base64)",
                };
                println!(
                    "--- {} {verb} {}{tag}",
                    response.received_at.format("%Y-%m-%d %H:%M:%S"),
                    response
                        .command_id
                        .map(|id| id.to_string())
                        .unwrap_or_default(),
                );
                println!("{text}");
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Init { force } => {
                if config_file.exists() && !force {
                    println!(
                        "Config already exists at {} (use --force to overwrite).",
                        config_file.display()
                    );
                } else {
                    ControllerConfig::default().save(&config_file)?;
                    println!("Wrote {}", config_file.display());
                }
            }
        },
    }

    Ok(())
}

fn select(store: AgentStore, agent: &str) -> Result<Operator> {
    let mut operator = Operator::new(store);
    operator.select_agent(agent)?;
    Ok(operator)
}

fn submit(store: AgentStore, agent: &str, command: Command) -> Result<()> {
    let operator = select(store, agent)?;
    let command = operator.submit(command)?;
    println!("Queued {} {} for {agent}", command.verb(), command.id());
    Ok(())
}

/// `NEST_BIND` / `NEST_PORT` take precedence over the config file.
fn apply_env_overrides(config: &mut ControllerConfig) -> Result<()> {
    if let Ok(bind) = std::env::var("NEST_BIND") {
        config.bind = bind;
    }
    if let Ok(port) = std::env::var("NEST_PORT") {
        config.port = port.parse().map_err(|_| ConfigError::Invalid {
            message: format!("NEST_PORT must be a port number, got {port:?}"),
        })?;
    }
    Ok(())
}

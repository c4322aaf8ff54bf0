//! `spawn`: run Claude workers in Docker containers bound to repository
//! environments.

mod config;
mod editor;
mod exit_codes;
mod logging;
mod render;

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use spawn_core::models::{WorkerId, WorkerStatus};
use spawn_core::orchestration::{
    CreateEnvironmentRequest, CreateWorkerRequest, EnvironmentService, WorkerController,
    WorkerFilter, WorkerRunOutcome,
};
use spawn_core::persistence::Registry;
use spawn_core::runtime::{DockerRuntime, LogStream, ProcessEnvironment};
use spawn_core::sqlite::SqliteStore;

use crate::config::{SpawnConfig, default_config_path, load_config, write_config};
use crate::editor::ExternalEditor;

#[derive(Parser, Debug)]
#[command(
    name = "spawn",
    version,
    about = "Run Claude workers in Docker containers bound to repository environments"
)]
struct Cli {
    /// Config file (default: <config dir>/spawn/config.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage environments (repository contexts for workers).
    #[command(visible_alias = "project")]
    Env(EnvArgs),
    /// Create, inspect and destroy workers.
    Worker(WorkerArgs),
    /// Inspect or initialize the config file.
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
struct EnvArgs {
    #[command(subcommand)]
    command: EnvCommand,
}

#[derive(Subcommand, Debug)]
enum EnvCommand {
    /// Register a repository as a new environment.
    Create {
        name: String,
        #[arg(long)]
        repo: String,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        image: Option<String>,
        /// Variable injected into every worker; repeatable.
        #[arg(long = "env", value_name = "KEY=VALUE")]
        vars: Vec<String>,
    },
    List,
    /// Show one environment by id or name.
    Show { environment: String },
    /// Delete an environment and its worker records.
    Delete {
        environment: String,
        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Args, Debug)]
struct WorkerArgs {
    #[command(subcommand)]
    command: WorkerCommand,
}

#[derive(Subcommand, Debug)]
enum WorkerCommand {
    /// Start a worker; without --prompt an editor is opened.
    Create {
        /// Environment id or name.
        #[arg(long = "env", visible_alias = "project")]
        environment: String,
        #[arg(short, long)]
        prompt: Option<String>,
        /// Return once the container is running instead of streaming output.
        #[arg(short, long)]
        detached: bool,
    },
    List {
        #[arg(long = "env")]
        environment: Option<String>,
        /// creating, running, stopped or failed.
        #[arg(long)]
        status: Option<WorkerStatus>,
    },
    Show { id: String },
    /// Print container output.
    Logs {
        id: String,
        #[arg(short, long)]
        follow: bool,
    },
    /// Follow the output of a running worker.
    Connect { id: String },
    /// Stop and remove the container, then delete the worker.
    Destroy {
        id: String,
        /// Kill instead of stopping gracefully.
        #[arg(short, long)]
        force: bool,
    },
    /// Destroy every worker of an environment.
    DestroyAll {
        #[arg(long = "env")]
        environment: String,
        #[arg(short, long)]
        force: bool,
    },
    /// Settle running workers whose containers have exited or vanished.
    Reconcile,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration.
    Show,
    /// Write the default configuration file.
    Init {
        #[arg(long)]
        force: bool,
    },
}

struct App {
    config_path: PathBuf,
    config: SpawnConfig,
}

impl App {
    fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(default_config_path);
        let config = load_config(&config_path)?;
        Ok(Self {
            config_path,
            config,
        })
    }

    fn registry(&self) -> Result<Arc<dyn Registry>> {
        let path = &self.config.registry.database_path;
        let store = SqliteStore::open(path)
            .with_context(|| format!("open registry {}", path.display()))?;
        Ok(Arc::new(store))
    }

    fn environments(&self) -> Result<EnvironmentService> {
        Ok(EnvironmentService::new(self.registry()?)
            .with_defaults(self.config.environment_defaults()))
    }

    fn controller(&self) -> Result<WorkerController> {
        let runtime = DockerRuntime::connect(self.config.docker_runtime_config())?;
        Ok(WorkerController::new(
            self.registry()?,
            Arc::new(runtime),
            Arc::new(ProcessEnvironment),
        )
        .with_settings(self.config.controller_settings())
        .with_editor(Arc::new(ExternalEditor::from_env())))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::for_error(&err)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let app = App::load(cli.config)?;
    match cli.command {
        Command::Env(args) => run_env(&app, args.command).await,
        Command::Worker(args) => run_worker(&app, args.command).await,
        Command::Config(args) => run_config(&app, args.command),
    }
}

async fn run_env(app: &App, command: EnvCommand) -> Result<i32> {
    let service = app.environments()?;
    match command {
        EnvCommand::Create {
            name,
            repo,
            branch,
            image,
            vars,
        } => {
            let environment = service
                .create_environment(CreateEnvironmentRequest {
                    name,
                    repo_url: repo,
                    branch,
                    docker_image: image,
                    vars,
                })
                .await?;
            println!(
                "Created environment {} ({})",
                environment.name, environment.id
            );
        }
        EnvCommand::List => {
            let environments = service.list_environments().await?;
            print!("{}", render::environment_table(&environments));
        }
        EnvCommand::Show { environment } => {
            let environment = service.resolve_environment(&environment).await?;
            let registry = app.registry()?;
            let id = environment.id.clone();
            let workers = tokio::task::spawn_blocking(move || {
                registry.list_workers_for_environment(&id)
            })
            .await
            .context("list environment workers")??;
            print!("{}", render::environment_detail(&environment, &workers));
        }
        EnvCommand::Delete { environment, yes } => {
            let target = service.resolve_environment(&environment).await?;
            let question = format!(
                "Delete environment '{}' ({}) and all of its worker records?",
                target.name, target.id
            );
            if !yes && !confirm(&question)? {
                println!("Aborted.");
                return Ok(exit_codes::OK);
            }
            let deleted = service.delete_environment(target.id.as_str()).await?;
            println!("Deleted environment {} ({})", deleted.name, deleted.id);
        }
    }
    Ok(exit_codes::OK)
}

async fn run_worker(app: &App, command: WorkerCommand) -> Result<i32> {
    match command {
        WorkerCommand::Create {
            environment,
            prompt,
            detached,
        } => {
            let controller = app.controller()?;
            let request = CreateWorkerRequest {
                environment,
                prompt,
                detached,
            };
            let outcome = controller
                .create_worker(request, |line| println!("{line}"), interrupted())
                .await?;
            Ok(report_outcome(&outcome))
        }
        WorkerCommand::List {
            environment,
            status,
        } => {
            let controller = app.controller()?;
            let workers = controller
                .list_workers(WorkerFilter {
                    environment,
                    status,
                })
                .await?;
            print!("{}", render::worker_table(&workers));
            Ok(exit_codes::OK)
        }
        WorkerCommand::Show { id } => {
            let worker = app.controller()?.get_worker(&WorkerId(id)).await?;
            print!("{}", render::worker_detail(&worker));
            Ok(exit_codes::OK)
        }
        WorkerCommand::Logs { id, follow } => {
            let lines = app
                .controller()?
                .stream_logs_for_worker(&WorkerId(id), follow)
                .await?;
            print_lines(lines).await
        }
        WorkerCommand::Connect { id } => {
            let lines = app.controller()?.connect_worker(&WorkerId(id)).await?;
            print_lines(lines).await
        }
        WorkerCommand::Destroy { id, force } => {
            let worker = app
                .controller()?
                .destroy_worker(&WorkerId(id), force)
                .await?;
            println!("Destroyed worker {}", worker.id);
            Ok(exit_codes::OK)
        }
        WorkerCommand::DestroyAll { environment, force } => {
            let destroyed = app
                .controller()?
                .destroy_environment_workers(&environment, force)
                .await?;
            println!("Destroyed {} worker(s)", destroyed.len());
            Ok(exit_codes::OK)
        }
        WorkerCommand::Reconcile => {
            let changes = app.controller()?.reconcile_workers().await?;
            print!("{}", render::reconciliation(&changes));
            Ok(exit_codes::OK)
        }
    }
}

fn run_config(app: &App, command: ConfigCommand) -> Result<i32> {
    match command {
        ConfigCommand::Show => {
            println!("# {}", app.config_path.display());
            print!(
                "{}",
                toml::to_string_pretty(&app.config).context("serialize config toml")?
            );
        }
        ConfigCommand::Init { force } => {
            if app.config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists; pass --force to overwrite",
                    app.config_path.display()
                );
            }
            write_config(&app.config_path, &SpawnConfig::default())?;
            println!("Wrote {}", app.config_path.display());
        }
    }
    Ok(exit_codes::OK)
}

fn report_outcome(outcome: &WorkerRunOutcome) -> i32 {
    match outcome {
        WorkerRunOutcome::Detached(worker) => {
            println!(
                "Worker {} running in container {}",
                worker.id,
                worker.container_id.as_deref().unwrap_or("-")
            );
            println!("Follow its output with `spawn worker logs {} --follow`", worker.id);
            exit_codes::OK
        }
        WorkerRunOutcome::Exited { worker, exit_code } => {
            println!(
                "Worker {} finished with exit code {exit_code} ({})",
                worker.id, worker.status
            );
            if worker.status == WorkerStatus::Failed {
                exit_codes::WORKER_FAILED
            } else {
                exit_codes::OK
            }
        }
        WorkerRunOutcome::Interrupted(worker) => {
            eprintln!(
                "Detached from worker {}; it keeps running. Reattach with `spawn worker connect {}`",
                worker.id, worker.id
            );
            exit_codes::INTERRUPTED
        }
    }
}

async fn print_lines(mut lines: LogStream) -> Result<i32> {
    let interrupt = interrupted();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(line) => println!("{}", line?),
                None => return Ok(exit_codes::OK),
            },
            () = &mut interrupt => return Ok(exit_codes::INTERRUPTED),
        }
    }
}

/// Resolves on Ctrl+C. Never resolves if the handler cannot be installed.
async fn interrupted() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush().context("flush stdout")?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("read confirmation")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

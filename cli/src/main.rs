use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use aegis_core::{AuditLog, ConfigStore, EventBus, PermissionGate};
use aegis_observability::{init_process_logging, ProcessKind};
use aegis_oracle::{OracleRegistry, ScriptedOracle};
use aegis_orchestrator::{Executor, Orchestrator, Planner, RecoveryManager, RoutingClassifier, TaskManager};
use aegis_tools::PluginRegistry;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "aegis")]
#[command(about = "Headless agent orchestration core")]
struct Cli {
    #[arg(long, env = "AEGIS_STATE_DIR")]
    state_dir: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single query and print the response.
    Run { prompt: String },
    /// Interactive stdin loop, one query per line.
    Chat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state_dir = resolve_state_dir(cli.state_dir);
    let (_guard, log_info) = init_process_logging(ProcessKind::Cli, &state_dir.join("logs"), 14)?;
    info!(logs_dir = %log_info.logs_dir, "aegis cli starting");

    let orchestrator = build_orchestrator(&state_dir).await?;

    match cli.command {
        Command::Run { prompt } => {
            let reply = orchestrator.handle_message("local", &prompt).await?;
            println!("{reply}");
        }
        Command::Chat => {
            run_chat_loop(&orchestrator).await?;
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}

async fn run_chat_loop(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" || line == "/exit" {
            break;
        }
        match orchestrator.handle_message("local", line).await {
            Ok(reply) => println!("{reply}"),
            Err(err) => eprintln!("error: {err}"),
        }
    }
    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    PathBuf::from(".aegis")
}

async fn build_orchestrator(state_dir: &PathBuf) -> anyhow::Result<Orchestrator> {
    std::fs::create_dir_all(state_dir)?;

    let config_store = ConfigStore::new(Some(state_dir.join("config.json")));
    let config = config_store.load(None).await?;

    let event_bus = EventBus::new();
    let audit_log = Arc::new(AuditLog::open(
        state_dir.join("audit.sqlite3"),
        config.audit_retention_days,
    )?);
    let permission_gate = Arc::new(PermissionGate::new(event_bus.clone(), config.permission_timeout_ms));

    let plugin_registry = Arc::new(PluginRegistry::new());
    let oracle_registry = Arc::new(OracleRegistry::new());
    oracle_registry
        .register(Arc::new(ScriptedOracle::new("scripted")), true)
        .await;

    let routing = Arc::new(RoutingClassifier::new(
        oracle_registry.clone(),
        plugin_registry.clone(),
        config.routing_cache_ttl_ms,
        config.routing_confidence_threshold,
    ));
    let planner = Arc::new(Planner::new(oracle_registry.clone(), plugin_registry.clone()));
    let executor = Arc::new(
        Executor::new(
            event_bus.clone(),
            audit_log.clone(),
            permission_gate.clone(),
            plugin_registry.clone(),
            oracle_registry.clone(),
            planner.clone(),
            config.max_retries,
        )
        .with_step_timeout_ms(config.step_timeout_ms),
    );
    let task_manager = Arc::new(TaskManager::new(
        event_bus.clone(),
        config.max_concurrent_tasks_per_client,
    ));
    let recovery = Arc::new(RecoveryManager::new());

    Ok(Orchestrator::new(
        event_bus,
        audit_log,
        permission_gate,
        plugin_registry,
        oracle_registry,
        routing,
        planner,
        executor,
        task_manager,
        recovery,
        config.health_check_interval_ms,
    ))
}

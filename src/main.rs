//! Switchboard: session router for multi-agent voice assistants

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use switchboard_core::{AuthMode, BindMode, SwitchboardConfig};
use switchboard_gateway::start_gateway;
use switchboard_workflow::{Workflow, WorkflowDefinition};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_CONFIG: &str = "switchboard.toml";

#[derive(Parser)]
#[command(name = "switchboard", about = "Switchboard: routes client sessions between agent processes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Serve(ServeArgs),
    /// Load and validate a workflow definition
    CheckWorkflow {
        path: PathBuf,
    },
    /// Print the effective configuration as TOML
    PrintConfig {
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Show version
    Version,
}

#[derive(clap::Args, Default)]
struct ServeArgs {
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    #[arg(short, long)]
    port: Option<u16>,
    /// lan | loopback
    #[arg(short, long)]
    bind: Option<String>,
    #[arg(short, long, env = "SWITCHBOARD_GATEWAY_TOKEN", hide_env_values = true)]
    token: Option<String>,
    #[arg(long)]
    no_auth: bool,
    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// JSON log lines
    #[arg(long)]
    json: bool,
}

/// Command-line flags win over the config file.
fn apply_overrides(config: &mut SwitchboardConfig, args: &ServeArgs) {
    if let Some(port) = args.port {
        config.gateway.port = port;
    }
    if let Some(bind) = &args.bind {
        config.gateway.bind = BindMode::parse(bind);
    }
    if let Some(token) = &args.token {
        config.gateway.auth.token = Some(token.clone());
    }
    if args.no_auth {
        config.gateway.auth.mode = AuthMode::None;
        config.gateway.auth.token = None;
    }
}

fn init_tracing(json: bool, log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "switchboard=info,tower_http=info".into());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("invalid log file path {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
    Ok(guard)
}

fn check_workflow(path: &Path) -> anyhow::Result<()> {
    let definition = WorkflowDefinition::from_path(path)?;
    let workflow = Workflow::load(definition).with_context(|| format!("{} is not a valid workflow", path.display()))?;
    println!("workflow for agent '{}'", workflow.agent_id());
    println!("  entry node: {}", workflow.entry().id);
    println!("  nodes:      {}", workflow.nodes().len());
    println!("  edges:      {}", workflow.edge_count());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let _guard = init_tracing(args.json, args.log_file.as_deref())?;
            let mut config = SwitchboardConfig::load(&args.config)?;
            apply_overrides(&mut config, &args);
            info!(
                config = %args.config.display(),
                port = config.gateway.port,
                entry_agent = %config.router.entry_agent,
                "Configuration loaded"
            );
            start_gateway(config, None).await?;
        }
        Commands::CheckWorkflow { path } => check_workflow(&path)?,
        Commands::PrintConfig { config } => {
            let config = SwitchboardConfig::load(&config)?;
            print!("{}", config.to_toml()?);
        }
        Commands::Version => {
            println!("switchboard v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_serve_flags() {
        let cli = Cli::try_parse_from([
            "switchboard", "serve", "--port", "9000", "--bind", "loopback", "--no-auth", "--json",
        ])
        .unwrap();
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.port, Some(9000));
        assert!(args.no_auth);
        assert!(args.json);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG));
    }

    #[test]
    fn flags_override_config() {
        let mut config = SwitchboardConfig::default();
        let args = ServeArgs {
            port: Some(9000),
            bind: Some("loopback".into()),
            token: Some("flag-token".into()),
            ..Default::default()
        };
        apply_overrides(&mut config, &args);
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.bind, BindMode::Loopback);
        assert_eq!(config.gateway.auth.token.as_deref(), Some("flag-token"));
        assert_eq!(config.gateway.auth.mode, AuthMode::Token);
    }

    #[test]
    fn no_auth_clears_token() {
        let mut config = SwitchboardConfig::default();
        config.gateway.auth.token = Some("file-token".into());
        let args = ServeArgs {
            no_auth: true,
            ..Default::default()
        };
        apply_overrides(&mut config, &args);
        assert_eq!(config.gateway.auth.mode, AuthMode::None);
        assert!(config.gateway.auth.token.is_none());
    }

    #[test]
    fn shipped_workflows_check_out() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("workflows");
        for name in ["triage.toml", "idv.toml", "banking.toml"] {
            check_workflow(&dir.join(name)).unwrap();
        }
    }
}

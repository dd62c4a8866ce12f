use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use engine_pipe::config::{self, EngineConfig};
use engine_pipe::dispatch::{
    Command as EngineCommand, CommandRegistry, ConnectionPool, Dispatcher, Platform, TcpConnector,
};
use engine_pipe::process;

#[derive(Parser)]
#[command(name = "engine-pipe", version, about = "Drive a running 3D editor over its command pipe.")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file (default: search for engine-pipe.yaml upward from cwd)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Write logs to this directory instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Write logs under the per-user data directory instead of stderr
    #[arg(long, global = true, default_value_t = false)]
    log_file: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// List the commands a platform supports and their remote method names
    Commands {
        #[arg(short, long)]
        platform: Option<Platform>,
    },
    /// Dispatch one command and print the decoded response as JSON
    Call {
        /// Command identifier, e.g. unity_editor_assetdatabase_find_assets
        command: EngineCommand,

        /// Positional parameter as JSON; repeat for more
        #[arg(short = 'P', long = "param", value_parser = parse_json)]
        params: Vec<serde_json::Value>,

        #[arg(short, long)]
        platform: Option<Platform>,

        /// Engine address (host:port); overrides config
        #[arg(short, long)]
        address: Option<String>,

        /// Call timeout in milliseconds; overrides config
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },
    /// List running processes, optionally filtered by name
    Processes {
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Terminate every process with this exact name, or every host process
    /// the config lists for a platform
    Kill {
        #[arg(required_unless_present = "platform")]
        name: Option<String>,

        #[arg(short, long, conflicts_with = "name")]
        platform: Option<Platform>,
    },
}

impl Cli {
    /// `--log-dir` wins over `--log-file`; neither means stderr.
    fn log_dir(&self) -> Option<PathBuf> {
        match (&self.log_dir, self.log_file) {
            (Some(dir), _) => Some(dir.clone()),
            (None, true) => Some(engine_pipe::data_dir().join("logs")),
            (None, false) => None,
        }
    }
}

/// Process names `kill` should terminate.
fn kill_targets(name: Option<String>, platform: Option<Platform>, config: &EngineConfig) -> Vec<String> {
    match (name, platform) {
        (Some(name), _) => vec![name],
        (None, Some(platform)) => config.processes_for(platform).to_vec(),
        (None, None) => Vec::new(),
    }
}

fn parse_json(raw: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON parameter: {e}"))
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => config::load_config(path).context("failed to load config"),
        None => {
            let cwd = std::env::current_dir().context("failed to read current directory")?;
            config::load_or_default(&cwd).context("failed to load config")
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    engine_pipe::init_tracing(cli.log_dir().as_deref(), cli.log_json)
        .context("failed to initialize logging")?;

    match cli.command {
        Command::Commands { platform } => {
            let config = load_config(cli.config.as_ref())?;
            let platform = platform.unwrap_or(config.default_platform);
            let registry = CommandRegistry::builtin();
            for (command, method) in registry.commands_for(platform) {
                println!("{:<48} {method}", command.as_str());
            }
        }
        Command::Call {
            command,
            params,
            platform,
            address,
            timeout_ms,
        } => {
            let config = load_config(cli.config.as_ref())?;
            let address = address.unwrap_or_else(|| config.resolve_address());
            let timeout = timeout_ms.map(Duration::from_millis);

            let connector = TcpConnector::new()
                .context("failed to start I/O runtime")?
                .with_connect_timeout(config.connect_timeout());
            let pool = Arc::new(ConnectionPool::new(Arc::new(connector)));
            let dispatcher = Dispatcher::new(
                Arc::new(CommandRegistry::builtin()),
                Arc::clone(&pool),
                config.default_platform,
                address,
            )
            .with_default_timeout(config.call_timeout());

            let response = dispatcher
                .dispatch(command, params, platform, timeout)
                .with_context(|| format!("'{command}' failed against {}", dispatcher.address()))?;
            pool.close_all();

            println!(
                "{}",
                serde_json::to_string_pretty(&response).context("failed to render response")?
            );
            if !response.is_success() {
                anyhow::bail!(
                    "remote operation failed with code {}: {}",
                    response.status.code,
                    response.status.message
                );
            }
        }
        Command::Processes { name } => {
            for p in process::list_processes(name.as_deref()) {
                println!("{:>8}  {}", p.pid, p.name);
            }
        }
        Command::Kill { name, platform } => {
            let config = load_config(cli.config.as_ref())?;
            let targets = kill_targets(name, platform, &config);
            if targets.is_empty() {
                anyhow::bail!("no host processes configured for this platform");
            }
            for name in targets {
                let killed = process::kill_by_name(&name);
                println!("terminated {killed} process(es) named '{name}'");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_dir_precedence() {
        let cli = Cli::try_parse_from(["engine-pipe", "commands"]).unwrap();
        assert_eq!(cli.log_dir(), None);

        let cli = Cli::try_parse_from(["engine-pipe", "commands", "--log-file"]).unwrap();
        assert_eq!(cli.log_dir(), Some(engine_pipe::data_dir().join("logs")));

        let cli =
            Cli::try_parse_from(["engine-pipe", "--log-dir", "/tmp/ep", "--log-file", "commands"]).unwrap();
        assert_eq!(cli.log_dir(), Some(PathBuf::from("/tmp/ep")));
    }

    #[test]
    fn test_kill_by_platform_uses_configured_names() {
        let mut config = EngineConfig::default();
        config
            .host_processes
            .insert(Platform::Unity, vec!["Unity".into(), "Unity Hub".into()]);

        let cli = Cli::try_parse_from(["engine-pipe", "kill", "--platform", "unity"]).unwrap();
        let Command::Kill { name, platform } = cli.command else {
            panic!("expected kill");
        };
        assert_eq!(kill_targets(name, platform, &config), ["Unity", "Unity Hub"]);
        assert!(kill_targets(None, Some(Platform::Godot), &config).is_empty());
        assert_eq!(kill_targets(Some("Blender".into()), None, &config), ["Blender"]);
    }

    #[test]
    fn test_kill_requires_name_or_platform() {
        assert!(Cli::try_parse_from(["engine-pipe", "kill"]).is_err());
        assert!(Cli::try_parse_from(["engine-pipe", "kill", "Unity", "--platform", "unity"]).is_err());
    }
}

use std::thread;

use anyhow::Context;
use clap::Parser;
use logging_lib::LoggingOpts;
use pingpong_lib::{
    BenchConfig, Direction, ExecutionModel, LoopbackFabric, LoopbackOptions, MAX_MSG_SIZE,
    MIN_MSG_SIZE, Reporter, TestMode, api::KeyMode, run,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "pingpong-sep")]
#[command(about = "Ping-pong latency and bandwidth over scalable-endpoint channels")]
struct Cli {
    /// Server to connect to. Runs as the server when omitted.
    server_name: Option<String>,

    /// Operation class to measure
    #[arg(short = 't', long = "test", default_value = "msg")]
    mode: TestMode,

    /// Number of independent channels
    #[arg(short = 'c', long = "channels", default_value = "1")]
    num_channels: usize,

    /// Data flows client to server only
    #[arg(short = '1', conflicts_with = "bidirectional")]
    one_way: bool,

    /// Data flows both ways
    #[arg(short = '2')]
    bidirectional: bool,

    /// Libfabric provider name hint
    #[arg(short = 'f', long = "provider")]
    provider_name: Option<String>,

    /// Threads driving the channels
    #[arg(long, default_value = "multi")]
    execution: ExecutionModel,

    #[arg(long, default_value_t = MIN_MSG_SIZE)]
    min_size: usize,

    #[arg(long, default_value_t = MAX_MSG_SIZE)]
    max_size: usize,

    /// Do not pin channel threads to CPUs
    #[arg(long)]
    no_pin: bool,

    /// Run server and client in this process over the in-memory provider
    #[arg(long, conflicts_with = "server_name")]
    loopback: bool,

    /// Application-chosen keys with offset addressing (loopback only)
    #[arg(long, requires = "loopback")]
    pooled_keys: bool,

    #[command(flatten)]
    logging: LoggingOpts,
}

impl Cli {
    fn config(&self) -> BenchConfig {
        let direction = if self.one_way {
            Some(Direction::OneWay)
        } else if self.bidirectional {
            Some(Direction::Bidirectional)
        } else {
            None
        };
        BenchConfig {
            mode: self.mode,
            num_channels: self.num_channels,
            direction,
            server_name: self.server_name.clone(),
            provider_name: self.provider_name.clone(),
            execution: self.execution,
            min_size: self.min_size,
            max_size: self.max_size,
            pin_threads: !self.no_pin,
        }
    }
}

/// Both sides in one process. Only the client's measurements are printed.
fn run_loopback(config: &BenchConfig, key_mode: KeyMode) -> anyhow::Result<()> {
    let fabric = LoopbackFabric::new();
    let options = LoopbackOptions { key_mode, ..Default::default() };
    let mut server = fabric.open("server", options, None)?;
    let mut client = fabric.open("client", options, Some("server"))?;
    let server_config = BenchConfig { server_name: None, ..config.clone() };
    let client_config = BenchConfig { server_name: Some("server".into()), ..config.clone() };

    let (server_result, client_result) = thread::scope(|s| {
        let server_run = thread::Builder::new()
            .name("pingpong-server".into())
            .spawn_scoped(s, || run(&mut server, &server_config, &mut Reporter::sink()))?;
        let client_result = run(&mut client, &client_config, &mut Reporter::stdout());
        let server_result = server_run
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        anyhow::Ok((server_result, client_result))
    })?;
    client_result.context("client")?;
    server_result.context("server")?;
    Ok(())
}

#[cfg(feature = "ofi")]
fn run_ofi(config: &BenchConfig) -> anyhow::Result<()> {
    let mut provider = pingpong_lib::OfiProvider::open(config)?;
    let summaries = run(&mut provider, config, &mut Reporter::stdout())?;
    info!(channels = summaries.len(), "done");
    Ok(())
}

#[cfg(not(feature = "ofi"))]
fn run_ofi(_config: &BenchConfig) -> anyhow::Result<()> {
    anyhow::bail!("built without the `ofi` feature; only --loopback is available")
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging_lib::init(&cli.logging)?;

    let config = cli.config();
    config.validate()?;
    info!(?config, "pingpong-sep");

    if cli.loopback {
        let key_mode =
            if cli.pooled_keys { KeyMode::Pooled } else { KeyMode::PerRegistration };
        return run_loopback(&config, key_mode);
    }
    run_ofi(&config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_flags() {
        let cli = Cli::try_parse_from(["pingpong-sep", "-t", "rma", "-c", "8", "-2"]).unwrap();
        let config = cli.config();
        assert_eq!(config.mode, TestMode::Rma);
        assert_eq!(config.num_channels, 8);
        assert_eq!(config.direction, Some(Direction::Bidirectional));

        let cli = Cli::try_parse_from(["pingpong-sep", "-1", "node7"]).unwrap();
        let config = cli.config();
        assert_eq!(config.direction, Some(Direction::OneWay));
        assert_eq!(config.server_name.as_deref(), Some("node7"));

        assert!(Cli::try_parse_from(["pingpong-sep", "-1", "-2"]).is_err());
    }

    #[test]
    fn loopback_excludes_server_name() {
        assert!(Cli::try_parse_from(["pingpong-sep", "--loopback", "node7"]).is_err());
        assert!(Cli::try_parse_from(["pingpong-sep", "--pooled-keys"]).is_err());
        let cli = Cli::try_parse_from([
            "pingpong-sep",
            "--loopback",
            "--pooled-keys",
            "--execution",
            "single",
            "--no-pin",
        ])
        .unwrap();
        assert_eq!(cli.config().execution, ExecutionModel::Single);
        assert!(!cli.config().pin_threads);
    }

    #[test]
    fn loopback_run_completes() {
        let config = BenchConfig {
            mode: TestMode::Tagged,
            num_channels: 2,
            min_size: 1,
            max_size: 8,
            pin_threads: false,
            ..BenchConfig::default()
        };
        run_loopback(&config, KeyMode::PerRegistration).unwrap();
    }
}

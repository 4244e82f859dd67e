use clap::{Args, ValueEnum};
use is_terminal::IsTerminal;
use tracing::{Dispatch, dispatcher};
use tracing_log::AsLog;
use tracing_subscriber::EnvFilter;

/// Diagnostics go to stderr so that report lines on stdout stay parseable.
#[derive(Debug, Clone, Args)]
pub struct LoggingOpts {
    #[arg(long, env = "PINGPONG_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    #[arg(long, env = "PINGPONG_LOG_COLOR", default_value = "auto")]
    pub log_color: LogColor,

    /// Additional level directives in the RUST_LOG format, e.g.
    /// `pingpong_lib::handshake=debug`. RUST_LOG wins for targets set in both.
    #[arg(long, env = "PINGPONG_LOG")]
    pub log_directives: Option<String>,
}

impl Default for LoggingOpts {
    fn default() -> Self {
        Self { log_format: LogFormat::Text, log_color: LogColor::Auto, log_directives: None }
    }
}

pub fn init(opts: &LoggingOpts) -> Result<(), anyhow::Error> {
    let color = match opts.log_color {
        LogColor::Auto => std::io::stderr().is_terminal(),
        LogColor::Always => true,
        LogColor::Never => false,
    };

    let mut log_filter_builder = EnvFilter::builder();
    if let Some(directives) = &opts.log_directives {
        log_filter_builder = log_filter_builder.with_default_directive(directives.parse()?);
    }
    let log_filter = log_filter_builder.from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_thread_names(true)
        .with_writer(std::io::stderr);

    let dispatch: Dispatch = match opts.log_format {
        LogFormat::Text => builder.with_ansi(color).finish().into(),
        LogFormat::Json => builder.json().finish().into(),
    };
    dispatcher::set_global_default(dispatch)?;

    // Must run after the global default is set to pick up its max level.
    tracing_log::LogTracer::builder()
        .with_max_level(tracing_core::LevelFilter::current().as_log())
        .init()?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogColor {
    Auto,
    Always,
    Never,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct Cli {
        #[command(flatten)]
        logging: LoggingOpts,
    }

    #[test]
    fn defaults_to_text_with_auto_color() {
        let cli = Cli::try_parse_from(["bench"]).unwrap();
        assert_eq!(cli.logging.log_format, LogFormat::Text);
        assert_eq!(cli.logging.log_color, LogColor::Auto);
    }

    #[test]
    fn parses_json_and_directives() {
        let cli = Cli::try_parse_from([
            "bench",
            "--log-format",
            "json",
            "--log-color",
            "never",
            "--log-directives",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.logging.log_format, LogFormat::Json);
        assert_eq!(cli.logging.log_color, LogColor::Never);
        assert_eq!(cli.logging.log_directives.as_deref(), Some("debug"));
    }
}

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "costate",
    about = "Two-party UI state synchronization: replay and transfer planning tools",
    author,
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "COSTATE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "COSTATE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,

    #[arg(
        long = "log-component",
        global = true,
        value_name = "AREA",
        value_delimiter = ',',
        env = "COSTATE_LOG_COMPONENTS",
        help = "Limit debug/trace output to these areas (session, intake, codec, ...)"
    )]
    pub components: Vec<String>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
            components: self.components.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a scenario through an in-process host and guest and report both replicas
    Replay(ReplayArgs),
    /// Show how a payload would be split for the signaling channel
    Plan(PlanArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ReplayArgs {
    #[arg(long, value_name = "FILE", help = "Scenario JSON with a `steps` array")]
    pub scenario: PathBuf,

    #[arg(long, value_name = "FILE", help = "Catalog JSON shared by both peers")]
    pub catalog: Option<PathBuf>,

    #[arg(
        long = "settle-ms",
        default_value_t = 2000,
        help = "How long to wait for both replicas to converge"
    )]
    pub settle_ms: u64,

    #[arg(long, help = "Print prometheus metrics after the report")]
    pub metrics: bool,
}

#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    #[arg(value_name = "FILE", help = "File holding the serialized payload")]
    pub payload: PathBuf,
}

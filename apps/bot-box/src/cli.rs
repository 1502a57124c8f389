use clap::{Args, Parser};
use std::path::PathBuf;

use crate::config::HardwareKind;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "bot-box",
    about = "Brokers remote-control sessions between the arena platform, operators and the robot",
    version
)]
pub struct Cli {
    #[arg(
        long = "env-file",
        value_name = "PATH",
        env = "BOT_BOX_ENV_FILE",
        help = "Load settings from this dotenv file before reading the environment"
    )]
    pub env_file: Option<PathBuf>,

    #[arg(
        long,
        value_enum,
        help = "Override the hardware transport selected by the `hardware` variable"
    )]
    pub hardware: Option<HardwareKind>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "BOT_BOX_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "BOT_BOX_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

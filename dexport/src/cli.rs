use std::{fmt, path::PathBuf};

use anyhow::{Result, bail};
use chrono::Duration;
use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;

use crate::crawl::{CrawlOptions, MAX_OVERLAP_MINUTES};
use crate::models::Snowflake;
use crate::record::Target;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Mode,

    /// Discord token
    #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true, global = true)]
    pub token: Option<String>,

    /// Send the token as a bot token
    #[arg(long, global = true)]
    pub bot: bool,

    /// Discord API base URL
    #[arg(long, env = "DISCORD_API_URL", global = true)]
    pub api_url: Option<String>,

    /// Directory for new record logs
    #[arg(short, long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Messages requested per page (1-100)
    #[arg(long, global = true)]
    pub page_size: Option<u16>,

    /// How far back a resumed channel is paginated again, in minutes
    #[arg(
        long,
        global = true,
        value_parser = clap::value_parser!(i64).range(0..=MAX_OVERLAP_MINUTES)
    )]
    pub overlap_minutes: Option<i64>,

    /// Log verbosity
    #[arg(short, long, value_name = "LEVEL", default_value_t = LogLevel::Info, global = true)]
    pub log_level: LogLevel,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Export every direct message and group channel
    Dm,
    /// Export every readable text channel of a server
    Server { id: Snowflake },
    /// Export the given channels, which must come from the same source
    Channels {
        #[arg(required = true)]
        id: Vec<Snowflake>,
    },
    /// Continue the run recorded in an existing log
    Continue { file: PathBuf },
}

impl Mode {
    /// Target recorded in `run_info`. `continue` reads its target from the log.
    pub fn target(&self) -> Result<Target> {
        Ok(match self {
            Mode::Dm => Target::Dm,
            Mode::Server { id } => Target::Server(*id),
            Mode::Channels { id } => Target::Channels(id.clone()),
            Mode::Continue { file } => {
                bail!("target of {} is only known after reading it", file.display())
            }
        })
    }
}

impl Args {
    pub fn crawl_options(&self) -> CrawlOptions {
        let mut options = CrawlOptions::default();
        if let Some(page_size) = self.page_size {
            options.page_size = page_size;
        }
        if let Some(minutes) = self.overlap_minutes {
            // config file values bypass the argument range check
            options.overlap = Duration::minutes(minutes.clamp(0, MAX_OVERLAP_MINUTES));
        }
        options
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

impl From<LogLevel> for LevelFilter {
    fn from(log_level: LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Off => LevelFilter::Off,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
            LogLevel::Off => write!(f, "off"),
        }
    }
}

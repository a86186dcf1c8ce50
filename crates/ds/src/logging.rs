//! Logging setup.
//!
//! Logs go to stderr so record lines on stdout stay pipeable. `RUST_LOG`
//! wins over the presets.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Invalid log format: '{}'. Use 'text' or 'json'.", s)),
        }
    }
}

/// Logging preset levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogPreset {
    /// Session lifecycle and warnings
    #[default]
    Normal,
    /// Per-event detail: context switches, hierarchy refreshes, replay steps
    Verbose,
    /// Warnings and errors only
    Quiet,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub preset: LogPreset,
    pub format: LogFormat,
}

impl LogConfig {
    /// Quiet wins when both flags are given.
    pub fn from_cli(verbose: bool, quiet: bool, format: LogFormat) -> Self {
        let preset = if quiet {
            LogPreset::Quiet
        } else if verbose {
            LogPreset::Verbose
        } else {
            LogPreset::Normal
        };
        Self { preset, format }
    }

    pub fn directives(&self) -> &'static str {
        match self.preset {
            LogPreset::Normal => "info",
            LogPreset::Verbose => "info,droidscope_core=debug,droidscope_recorder=debug,ds=debug",
            LogPreset::Quiet => "warn",
        }
    }

    pub fn build_filter(&self) -> EnvFilter {
        if let Ok(env_filter) = EnvFilter::try_from_default_env() {
            return env_filter;
        }
        EnvFilter::try_new(self.directives()).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

pub fn init(config: &LogConfig) {
    let filter = config.build_filter();

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr).with_target(true))
                .init();
        }
    }
}

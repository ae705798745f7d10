use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::errors::{Error, Result};
use crate::infrastructure::{LogConfig, LogFormat, LogOutput};

/// File name searched for by [`Config::discover`]
pub const CONFIG_FILE_NAME: &str = "pyshim.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub interpreter: InterpreterConfig,

    #[serde(default)]
    pub errors: ErrorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterpreterConfig {
    /// Directories prepended to `sys.path` when an interpreter handle is opened
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorConfig {
    #[serde(default)]
    pub capture: CaptureMode,

    /// Captured tracebacks are truncated to this many bytes
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

/// How the text of a pending exception is obtained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Let the interpreter print the traceback into a pipe and read it back
    #[default]
    Pipe,
    /// Format `type: value` without printing
    Format,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default = "default_format")]
    pub format: LogFormat,

    #[serde(default)]
    pub filter: Option<String>,

    /// Write rolling log files here instead of stderr
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            capture: CaptureMode::default(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
            filter: None,
            directory: None,
        }
    }
}

fn default_max_message_bytes() -> usize { 64 * 1024 }
fn default_level() -> String { "info".to_string() }
fn default_format() -> LogFormat { LogFormat::Compact }

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Relative search paths are resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

        let mut config = Self::parse(&content)?;
        if let Some(base) = path.parent() {
            for dir in &mut config.interpreter.search_paths {
                if dir.is_relative() {
                    *dir = base.join(&*dir);
                }
            }
        }
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }

    /// Find `pyshim.toml` in the current directory or its parents, falling
    /// back to defaults when none is found or readable.
    pub fn discover() -> Self {
        let mut current = std::env::current_dir().ok();

        while let Some(dir) = current {
            let candidate = dir.join(CONFIG_FILE_NAME);
            if candidate.is_file() {
                match Self::load(&candidate) {
                    Ok(config) => return config,
                    Err(e) => tracing::warn!(path = %candidate.display(), error = %e, "ignoring unreadable config"),
                }
            }
            current = dir.parent().map(Path::to_path_buf);
        }

        Self::default()
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))
    }

    /// Logging settings in the form `init_logging` takes
    pub fn log_config(&self) -> Result<LogConfig> {
        let level = tracing::Level::from_str(&self.logging.level)
            .map_err(|_| Error::Config(format!("unknown log level '{}'", self.logging.level)))?;

        let output = match &self.logging.directory {
            Some(dir) => LogOutput::File {
                directory: dir.to_string_lossy().into_owned(),
                prefix: "pyshim".to_string(),
            },
            None => LogOutput::Stderr,
        };

        let mut config = LogConfig::new()
            .with_level(level)
            .with_format(self.logging.format)
            .with_output(output);
        if let Some(filter) = &self.logging.filter {
            config = config.with_filter(filter.clone());
        }
        Ok(config)
    }
}

use anyhow::Context;
use std::str::FromStr;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Logging setup for hosts embedding the control plane.
/// With `file_dir` set, logs roll into files; otherwise stdout.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LoggerConfig {
    pub level: String,
    pub file_dir: Option<String>,
    pub file_prefix: Option<String>,
    pub rolling: Option<String>,
    #[serde(default)]
    pub max_files: usize,
}

impl LoggerConfig {
    /// Read configuration from `ARCHON_LOG_LEVEL`, `ARCHON_LOG_DIR`,
    /// `ARCHON_LOG_PREFIX` and `ARCHON_LOG_ROLLING`; missing variables
    /// fall back to defaults.
    pub fn from_env() -> Self {
        Self {
            level: std::env::var("ARCHON_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            file_dir: std::env::var("ARCHON_LOG_DIR").ok(),
            file_prefix: std::env::var("ARCHON_LOG_PREFIX").ok(),
            rolling: std::env::var("ARCHON_LOG_ROLLING").ok(),
            max_files: 3,
        }
    }

    pub fn init(&self) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
        let level = Level::from_str(&self.level).unwrap_or(Level::INFO);

        let Some(dir) = self.file_dir.as_deref() else {
            let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
            return Ok(None);
        };

        let rotation = match self.rolling.as_deref() {
            Some("hourly") => Rotation::HOURLY,
            Some("minutely") => Rotation::MINUTELY,
            _ => Rotation::DAILY,
        };

        let appender: RollingFileAppender = RollingFileAppender::builder()
            .rotation(rotation)
            .max_log_files(self.max_files.max(1))
            .filename_prefix(self.file_prefix.as_deref().unwrap_or("archon"))
            .build(dir)
            .with_context(|| format!("failed to create rolling appender in {dir}"))?;

        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(writer)
            .try_init();

        Ok(Some(guard))
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_dir: None,
            file_prefix: None,
            rolling: None,
            max_files: 3,
        }
    }
}

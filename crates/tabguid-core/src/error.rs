//! Error types for tabguid-core

use std::fmt::Write;
use thiserror::Error;

use crate::guid::Guid;
use crate::host::TabId;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tabguid-core
#[derive(Error, Debug)]
pub enum Error {
    /// Registry lookups and invariant checks
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Snapshot store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Host collaborator failures (tab queries, fingerprint requests)
    #[error("Host error: {0}")]
    Host(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True when the error reports a broken host uniqueness contract.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Registry(err) if err.is_fatal())
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Registry(err) => Some(err.remediation()),
            Self::Store(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Host(_) => Some(
                Remediation::new("The host tab manager did not answer. Retry once it is responsive.")
                    .alternative("Fingerprint requests fall back to hashing the tab URL."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Show config", "tg config")
                    .alternative("Verify the store directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Show snapshot", "tg show --json")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
        }
    }
}

/// Errors raised by registry lookups.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No current record holds the volatile id.
    #[error("no tab registered with id {0}")]
    TabNotFound(TabId),

    /// The guid is not present in the current partition.
    #[error("guid not found: {0}")]
    GuidNotFound(Guid),

    /// More than one current record holds the same volatile id.
    #[error("{count} current records share tab id {tab_id}")]
    Inconsistent { tab_id: TabId, count: usize },

    /// Query against a partition name that does not exist.
    #[error("invalid partition: {0}")]
    InvalidPartition(String),
}

impl RegistryError {
    /// Consistency violations are fatal; everything else is a normal miss.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Inconsistent { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TabNotFound(_) | Self::GuidNotFound(_))
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::TabNotFound(_) => Remediation::new(
                "The tab has not been reconciled yet. Wait for it to load and retry.",
            )
            .command("Show registry", "tg show"),
            Self::GuidNotFound(_) => {
                Remediation::new("The guid does not belong to an open tab.")
                    .command("Show registry", "tg show")
                    .alternative("Closed tabs keep their guid only until they are reopened.")
            }
            Self::Inconsistent { .. } => Remediation::new(
                "The host reported the same tab id for two open tabs. Reset the registry.",
            )
            .command("Reset registry", "tg reset --yes")
            .alternative("Report the host version; tab ids must be unique among open tabs."),
            Self::InvalidPartition(_) => {
                Remediation::new("Use one of the partitions: current, removed, prev.")
            }
        }
    }
}

/// Snapshot store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("snapshot corrupt: {0}")]
    Corrupt(String),

    #[error("snapshot writer is closed")]
    Closed,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl StoreError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Io { path, .. } => {
                Remediation::new(format!("Check that {path} is readable and writable."))
                    .command("Show config", "tg config")
            }
            Self::Database(_) => Remediation::new(
                "Snapshot database operation failed. Check the store path and retry.",
            )
            .command("Show config", "tg config")
            .alternative("Switch to the json_file backend."),
            Self::Corrupt(_) => Remediation::new(
                "The persisted snapshot could not be parsed. Clear it to start fresh.",
            )
            .command("Reset registry", "tg reset --yes"),
            Self::Closed => Remediation::new("The registry was shut down; create a new one."),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            )),
            Self::ParseFailed(_) | Self::SerializeFailed(_) => {
                Remediation::new("Config is not valid TOML. Fix the syntax and retry.")
                    .command("Show effective config", "tg config")
            }
            Self::ValidationError(_) => {
                Remediation::new("Config values are invalid. Correct them and retry.")
                    .command("Show effective config", "tg config")
            }
        }
    }
}

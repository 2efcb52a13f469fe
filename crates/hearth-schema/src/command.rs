//! The command-line vocabulary reserved by the service runtime.
//!
//! A [`CommandLine`] is the raw argument list of one invocation. It is what a
//! peer forwards to the primary and what the primary hands to its own
//! process hook. Reserved words may be written bare (`stop`) or with leading
//! dashes (`--stop`); anything else is passed through to the service as
//! [`RuntimeCommand::Argument`].

use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Selects test or production behavior of a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Production,
    Test,
}

impl FromStr for ExecutionMode {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(SchemaError::InvalidExecutionMode(other.to_owned())),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Production => f.write_str("production"),
            Self::Test => f.write_str("test"),
        }
    }
}

/// One interpreted argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCommand {
    Stop,
    Restart,
    Status,
    SettingsReset,
    ExecutionMode(ExecutionMode),
    NoUpdate,
    NoUpdateCheck,
    Watch,
    /// Look for a new release now, whatever the update policy.
    UpdateCheck,
    /// Stop, apply the staged update and relaunch.
    UpdateApply,
    /// Not part of the reserved vocabulary; left to the service.
    Argument(String),
}

impl RuntimeCommand {
    pub fn parse(raw: &str) -> Result<Self, SchemaError> {
        let word = raw.trim_start_matches('-');
        if let Some(mode) = word.strip_prefix("execution-mode=") {
            return Ok(Self::ExecutionMode(mode.parse()?));
        }
        Ok(match word {
            "stop" => Self::Stop,
            "restart" => Self::Restart,
            "status" => Self::Status,
            "settings-reset" => Self::SettingsReset,
            "no-update" => Self::NoUpdate,
            "no-update-check" => Self::NoUpdateCheck,
            "watch" => Self::Watch,
            "update-check" => Self::UpdateCheck,
            "update-apply" => Self::UpdateApply,
            _ => Self::Argument(raw.to_owned()),
        })
    }

    /// Commands that act once on a running instance and must not be replayed
    /// when the process relaunches itself.
    pub fn is_one_shot(&self) -> bool {
        matches!(
            self,
            Self::Stop
                | Self::Restart
                | Self::Status
                | Self::SettingsReset
                | Self::UpdateCheck
                | Self::UpdateApply
        )
    }
}

/// Raw argument list of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandLine {
    args: Vec<String>,
}

impl CommandLine {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Interpret every argument, in order.
    pub fn commands(&self) -> Result<Vec<RuntimeCommand>, SchemaError> {
        self.args.iter().map(|a| RuntimeCommand::parse(a)).collect()
    }

    /// Last `execution-mode=` given, if any. Malformed modes are ignored here;
    /// [`commands`](Self::commands) reports them.
    pub fn execution_mode(&self) -> Option<ExecutionMode> {
        self.args
            .iter()
            .filter_map(|a| match RuntimeCommand::parse(a) {
                Ok(RuntimeCommand::ExecutionMode(mode)) => Some(mode),
                _ => None,
            })
            .next_back()
    }

    pub fn contains(&self, command: &RuntimeCommand) -> bool {
        self.args
            .iter()
            .any(|a| RuntimeCommand::parse(a).is_ok_and(|c| c == *command))
    }

    /// The same command line with one-shot commands removed.
    #[must_use]
    pub fn without_one_shot(&self) -> Self {
        Self {
            args: self
                .args
                .iter()
                .filter(|a| !RuntimeCommand::parse(a).is_ok_and(|c| c.is_one_shot()))
                .cloned()
                .collect(),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args.join(" "))
    }
}

//! Runtime mode and the drain policy derived from it.
//!
//! # Design Decisions
//! - Mode is read once at startup and never mutated
//! - The policy is a pure function of the mode; the coordinator never
//!   branches on the mode directly

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Drain timeout used in production when nothing overrides it.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// How the server process is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    /// Development server: fast restarts matter more than background work.
    #[serde(alias = "development", alias = "dev")]
    #[value(aliases = ["development", "dev"])]
    Interactive,
    /// Deployed server: background work must not be lost on shutdown.
    #[default]
    #[serde(alias = "prod")]
    #[value(alias = "prod")]
    Production,
}

impl RuntimeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeMode::Interactive => "interactive",
            RuntimeMode::Production => "production",
        }
    }
}

impl fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a mode name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown runtime mode '{0}' (expected interactive or production)")]
pub struct UnknownMode(pub String);

impl FromStr for RuntimeMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interactive" | "development" | "dev" => Ok(RuntimeMode::Interactive),
            "production" | "prod" => Ok(RuntimeMode::Production),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}

/// Drain behavior applied by the shutdown coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// Wait for outstanding deferred tasks before exiting.
    pub wait_for_deferred_tasks: bool,
    /// Upper bound on the wait. Zero when not waiting.
    pub drain_timeout: Duration,
}

impl ShutdownPolicy {
    /// Replace the drain timeout of a waiting policy.
    ///
    /// A policy that does not wait keeps a zero timeout.
    pub fn with_drain_timeout(self, drain_timeout: Duration) -> Self {
        if !self.wait_for_deferred_tasks {
            return self;
        }
        Self {
            drain_timeout,
            ..self
        }
    }
}

/// Select the drain policy for a runtime mode.
pub fn policy_for(mode: RuntimeMode) -> ShutdownPolicy {
    match mode {
        RuntimeMode::Interactive => ShutdownPolicy {
            wait_for_deferred_tasks: false,
            drain_timeout: Duration::ZERO,
        },
        RuntimeMode::Production => ShutdownPolicy {
            wait_for_deferred_tasks: true,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interactive_does_not_wait() {
        let policy = policy_for(RuntimeMode::Interactive);
        assert!(!policy.wait_for_deferred_tasks);
        assert_eq!(policy.drain_timeout, Duration::ZERO);
    }

    #[test]
    fn production_waits_with_default_timeout() {
        let policy = policy_for(RuntimeMode::Production);
        assert!(policy.wait_for_deferred_tasks);
        assert_eq!(policy.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
    }

    #[test]
    fn policy_is_deterministic() {
        for mode in [RuntimeMode::Interactive, RuntimeMode::Production] {
            assert_eq!(policy_for(mode), policy_for(mode));
        }
    }

    #[test]
    fn timeout_override_only_applies_when_waiting() {
        let prod = policy_for(RuntimeMode::Production).with_drain_timeout(Duration::from_secs(5));
        assert_eq!(prod.drain_timeout, Duration::from_secs(5));

        let dev = policy_for(RuntimeMode::Interactive).with_drain_timeout(Duration::from_secs(5));
        assert_eq!(dev.drain_timeout, Duration::ZERO);
        assert!(!dev.wait_for_deferred_tasks);
    }

    #[test]
    fn parse_mode_aliases() {
        assert_eq!("dev".parse::<RuntimeMode>(), Ok(RuntimeMode::Interactive));
        assert_eq!("Development".parse::<RuntimeMode>(), Ok(RuntimeMode::Interactive));
        assert_eq!("prod".parse::<RuntimeMode>(), Ok(RuntimeMode::Production));
        assert!("staging".parse::<RuntimeMode>().is_err());
    }
}

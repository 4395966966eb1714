use std::fmt;

use strum::{Display, EnumString};

/// Machine-readable failure classes. The HTTP surface maps these onto
/// status codes; the scheduler maps job-scoped kinds onto `failed`
/// transitions with the kind recorded in the event reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    InfeasibleJob,
    Topology,
    Capacity,
    PricingStale,
    ProvisioningFailed,
    ExecutionFailed,
    BudgetExceeded,
    Persistence,
    Cancelled,
}

/// Error carried across the control plane: a short kind plus a free-form
/// message. Never a sentinel value.
#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn infeasible(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InfeasibleJob, message)
    }

    pub fn topology(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Topology, message)
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Capacity, message)
    }

    pub fn provisioning(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProvisioningFailed, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutionFailed, message)
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Persistence, message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::persistence(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::persistence(format!("json encoding: {e}"))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(ErrorKind::InfeasibleJob.to_string(), "infeasible_job");
        assert_eq!(
            ErrorKind::ProvisioningFailed.to_string(),
            "provisioning_failed"
        );
        assert_eq!(
            "budget_exceeded".parse::<ErrorKind>().unwrap(),
            ErrorKind::BudgetExceeded
        );
    }

    #[test]
    fn test_display_carries_kind_and_message() {
        let err = Error::validation("gpus must be > 0");
        assert_eq!(err.to_string(), "validation: gpus must be > 0");
    }
}

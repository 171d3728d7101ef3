use std::time::Duration;

use thiserror::Error;

use crate::domain::DeviceId;

/// Errors raised by the allocation and dispatch core.
///
/// None of these are fatal to the control loop: the controller turns each one into
/// a skipped tick, a fallback allocation or an error returned to the operator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    #[error("allocation problem is infeasible: {0}")]
    Infeasible(String),
    #[error("battery state read timed out after {0:?}")]
    StateReadTimeout(Duration),
    #[error("battery state read failed: {0}")]
    StateRead(String),
    #[error("unknown strategy kind: {0}")]
    UnknownStrategyKind(String),
    #[error("device {device} is already a member of group {group}")]
    DuplicateDevice { group: String, device: DeviceId },
    #[error("device {device} is not a member of group {group}")]
    MissingDevice { group: String, device: DeviceId },
    #[error("no strategy assigned")]
    NoStrategyAssigned,
    #[error("group {0} is already registered")]
    DuplicateGroup(String),
    #[error("unknown group: {0}")]
    UnknownGroup(String),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type ControlResult<T> = std::result::Result<T, ControlError>;

impl From<validator::ValidationErrors> for ControlError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ControlError::InvalidConfig(errors.to_string())
    }
}

//! Status codes reported by navigation queries

use navcrowd_common::Error;

/// Status enum for navigation query operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Operation was successful
    Success,
    /// Operation failed due to an unknown reason
    Failure,
    /// Provided parameter was invalid
    InvalidParam,
    /// No valid path exists
    PathInvalid,
    /// Pathfinding operation exceeded buffer capacity
    BufferTooSmall,
    /// Search ran out of nodes
    OutOfNodes,
    /// Value does not exist or is not found
    NotFound,
    /// Operation partially succeeded
    PartialResult,
}

impl Status {
    /// Checks if the status is a failure
    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    /// Checks if the status is a success
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success | Status::PartialResult)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => write!(f, "Success"),
            Status::Failure => write!(f, "Failure"),
            Status::InvalidParam => write!(f, "Invalid parameter"),
            Status::PathInvalid => write!(f, "Invalid path"),
            Status::BufferTooSmall => write!(f, "Buffer too small"),
            Status::OutOfNodes => write!(f, "Out of nodes"),
            Status::NotFound => write!(f, "Value not found"),
            Status::PartialResult => write!(f, "Partial result"),
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        match status {
            Status::InvalidParam => Error::InvalidParam(status.to_string()),
            Status::PathInvalid => Error::NoPathFound(status.to_string()),
            _ => Error::NavQuery(status.to_string()),
        }
    }
}

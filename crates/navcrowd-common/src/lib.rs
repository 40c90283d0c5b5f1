//! Common utilities and data structures shared by the navcrowd crates

mod geometry;
mod vector;

pub use geometry::*;
pub use vector::*;

/// Represents a 3D position
pub type Vec3 = glam::Vec3;

/// Error types for the library
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("navigation query failed: {0}")]
    NavQuery(String),

    #[error("agent pool is full ({0} agents)")]
    CapacityExceeded(usize),

    #[error("invalid agent handle: {0}")]
    InvalidAgentHandle(usize),

    #[error("no path found: {0}")]
    NoPathFound(String),

    #[error("corridor desync: {0}")]
    CorridorDesync(String),

    #[error("avoidance solver found no finite candidate")]
    SolverDegenerate,
}

/// Result type for navcrowd operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            Error::CapacityExceeded(4).to_string(),
            "agent pool is full (4 agents)"
        );
        assert_eq!(
            Error::InvalidAgentHandle(7).to_string(),
            "invalid agent handle: 7"
        );
        assert_eq!(
            Error::SolverDegenerate.to_string(),
            "avoidance solver found no finite candidate"
        );
    }
}

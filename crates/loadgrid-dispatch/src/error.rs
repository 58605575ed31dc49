//! Dispatcher error types.

use thiserror::Error;

/// Configuration errors rejected synchronously when a ramp is started.
///
/// A failed call leaves the dispatcher exactly as it was.
#[derive(Debug, Error, PartialEq)]
pub enum DispatchError {
    #[error("spawn rate must be a positive finite number, got {0}")]
    InvalidRate(f64),

    #[error("no user profiles configured")]
    NoProfiles,

    #[error("duplicate profile name: {0}")]
    DuplicateProfile(String),

    #[error("profile {name} has invalid weight {weight}")]
    InvalidWeight { name: String, weight: f64 },

    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    #[error("fixed count {fixed_count} of sole profile {name} exceeds target {target}")]
    FixedCountExceedsTarget {
        name: String,
        fixed_count: u64,
        target: u64,
    },

    #[error("target {target} exceeds the {capacity} users fixed-count profiles can hold")]
    FixedCapacityExceeded { target: u64, capacity: u64 },

    #[error("cannot place {target} users: no workers connected")]
    NoWorkers { target: u64 },
}

pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_input() {
        let err = DispatchError::FixedCountExceedsTarget {
            name: "admin".to_string(),
            fixed_count: 5,
            target: 3,
        };
        assert_eq!(
            err.to_string(),
            "fixed count 5 of sole profile admin exceeds target 3"
        );
        assert_eq!(
            DispatchError::NoWorkers { target: 4 }.to_string(),
            "cannot place 4 users: no workers connected"
        );
    }
}

// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Lock manager error types.

/// Errors surfaced by lock manager operations.
///
/// The manager never retries internally; every error propagates to the
/// caller. `Corrupted` and `ResourceNotFound` indicate misuse or impossible
/// states rather than recoverable conditions.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The calling job is already in the aborted state.
    #[error("job {job_id} is in aborted state")]
    Aborted { job_id: i32 },

    /// The lock manager decided the calling job must abort, either because
    /// its timeout flag was observed or because granting its request would
    /// create a deadlock. The timeout flag is set before this is returned.
    #[error("job {job_id} should abort (requested by the lock manager)")]
    AbortRequested { job_id: i32 },

    /// Unlock was called for a resource that is not locked.
    #[error("resource ({dataset_id}, {entity_hash}) not found")]
    ResourceNotFound { dataset_id: i32, entity_hash: i32 },

    /// An impossible internal state was observed, e.g. incompatible modes in
    /// a holder queue or a request missing from its expected queue.
    #[error("lock table corrupted: {reason}")]
    Corrupted { reason: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = LockError::Aborted { job_id: 4 };
        assert_eq!(err.to_string(), "job 4 is in aborted state");

        let err = LockError::ResourceNotFound {
            dataset_id: 7,
            entity_hash: -1,
        };
        assert_eq!(err.to_string(), "resource (7, -1) not found");
    }
}

//! Bounded retry and backoff logic for flowstore file operations
//!
//! Filesystem operations such as renaming a freshly written document over the
//! primary path can fail transiently while another process (a virus scanner,
//! a backup agent) holds the file. This crate provides a small blocking retry
//! loop with exponential backoff and a hard attempt bound.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Boxed error carried by retry failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Common retry error types
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Operation '{operation}' failed after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        attempts: usize,
        source: BoxError,
    },
    #[error("Transient error in '{operation}': {source}")]
    Transient {
        operation: &'static str,
        source: BoxError,
    },
    #[error("Permanent error in '{operation}': {source}")]
    Permanent {
        operation: &'static str,
        source: BoxError,
    },
}

impl RetryError {
    /// Consume the error and return the underlying cause
    pub fn into_source(self) -> BoxError {
        match self {
            RetryError::MaxRetriesExceeded { source, .. }
            | RetryError::Transient { source, .. }
            | RetryError::Permanent { source, .. } => source,
        }
    }

    /// Number of attempts made before giving up, when known
    pub fn attempts(&self) -> Option<usize> {
        match self {
            RetryError::MaxRetriesExceeded { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// Run a blocking operation, retrying transient failures
///
/// `f` receives the 1-based attempt number. A `Transient` error sleeps for the
/// next interval of `policy` and tries again, up to `max_attempts` calls in
/// total. A `Permanent` error is returned immediately. When the attempts are
/// exhausted the last error is returned inside `MaxRetriesExceeded`.
pub fn retry_blocking<F, T>(
    op_name: &'static str,
    max_attempts: usize,
    mut policy: ExponentialBackoff,
    mut f: F,
) -> RetryResult<T>
where
    F: FnMut(usize) -> RetryResult<T>,
{
    let max_attempts = max_attempts.max(1);
    policy.reset();
    let mut attempt = 1;

    loop {
        debug!("Attempting operation '{}' (attempt {})", op_name, attempt);

        match f(attempt) {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        "Operation '{}' succeeded after {} attempts",
                        op_name, attempt
                    );
                }
                return Ok(result);
            }
            Err(err @ RetryError::Permanent { .. }) => {
                warn!(
                    "Operation '{}' failed permanently on attempt {}: {}",
                    op_name, attempt, err
                );
                return Err(err);
            }
            Err(err) => {
                warn!(
                    "Operation '{}' failed on attempt {}/{}: {}",
                    op_name, attempt, max_attempts, err
                );

                if attempt >= max_attempts {
                    return Err(RetryError::MaxRetriesExceeded {
                        operation: op_name,
                        attempts: attempt,
                        source: err.into_source(),
                    });
                }

                let delay = policy
                    .next_backoff()
                    .unwrap_or_else(|| Duration::from_millis(10 * attempt as u64));
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// Backoff policy for local file operations (short waits)
pub fn local_storage_backoff_policy() -> ExponentialBackoff {
    local_storage_backoff_with(Duration::from_millis(20))
}

/// Local file backoff starting from a custom initial interval
pub fn local_storage_backoff_with(initial: Duration) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(initial)
        .with_max_interval(Duration::from_secs(1))
        .with_max_elapsed_time(None)
        .with_multiplier(2.0)
        .build()
}

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

impl RetryableError for std::io::Error {
    fn is_transient(&self) -> bool {
        // A missing source or an invalid target will not fix itself; anything
        // else may be another process briefly holding the file.
        !matches!(
            self.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::InvalidInput
                | std::io::ErrorKind::Unsupported
        )
    }
}

/// Classify an error into the matching `RetryError` variant
pub fn classify<E>(operation: &'static str, err: E) -> RetryError
where
    E: RetryableError + std::error::Error + Send + Sync + 'static,
{
    if err.is_transient() {
        RetryError::Transient {
            operation,
            source: Box::new(err),
        }
    } else {
        RetryError::Permanent {
            operation,
            source: Box::new(err),
        }
    }
}

/// Helper macro for creating transient errors
#[macro_export]
macro_rules! transient_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Transient {
            operation: $op,
            source: Box::new($err),
        }
    };
}

/// Helper macro for creating permanent errors
#[macro_export]
macro_rules! permanent_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Permanent {
            operation: $op,
            source: Box::new($err),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn fast_policy() -> ExponentialBackoff {
        local_storage_backoff_with(Duration::from_millis(1))
    }

    #[test]
    fn test_successful_operation() {
        let result = retry_blocking("test_op", 5, fast_policy(), |_attempt| Ok("success"));

        assert_eq!(result.unwrap(), "success");
    }

    #[test]
    fn test_transient_failure_then_success() {
        let mut calls = 0;

        let result = retry_blocking("test_op", 5, fast_policy(), |attempt| {
            calls += 1;
            if attempt < 3 {
                Err(transient_error!(
                    "test_op",
                    io::Error::new(io::ErrorKind::PermissionDenied, "file is locked")
                ))
            } else {
                Ok(attempt)
            }
        });

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_permanent_failure_stops_immediately() {
        let mut calls = 0;

        let result: RetryResult<()> = retry_blocking("test_op", 5, fast_policy(), |_attempt| {
            calls += 1;
            Err(permanent_error!(
                "test_op",
                io::Error::new(io::ErrorKind::NotFound, "gone")
            ))
        });

        assert!(matches!(result, Err(RetryError::Permanent { .. })));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_attempts_are_bounded() {
        let mut calls = 0;

        let result: RetryResult<()> = retry_blocking("rename", 5, fast_policy(), |_attempt| {
            calls += 1;
            Err(transient_error!(
                "rename",
                io::Error::new(io::ErrorKind::PermissionDenied, "still locked")
            ))
        });

        assert_eq!(calls, 5);
        let err = result.unwrap_err();
        assert_eq!(err.attempts(), Some(5));
        assert!(err.to_string().contains("still locked"));
    }

    #[test]
    fn test_local_policy_is_short_and_unbounded_in_time() {
        let policy = local_storage_backoff_policy();

        assert_eq!(policy.initial_interval, Duration::from_millis(20));
        assert_eq!(policy.max_interval, Duration::from_secs(1));
        assert!(policy.max_elapsed_time.is_none());
    }

    #[test]
    fn test_io_error_classification() {
        let locked = io::Error::new(io::ErrorKind::PermissionDenied, "locked");
        let missing = io::Error::new(io::ErrorKind::NotFound, "missing");

        assert!(locked.is_transient());
        assert!(missing.is_permanent());
        assert!(matches!(
            classify("rename", missing),
            RetryError::Permanent { .. }
        ));
    }
}

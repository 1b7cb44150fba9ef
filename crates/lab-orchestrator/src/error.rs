//! Error taxonomy for lab orchestration

use bollard::errors::Error as DockerError;
use thiserror::Error;

/// Errors surfaced by orchestration operations.
///
/// Best-effort work (logon probes, flag refresh, secondary network reattach,
/// reaper removals) never produces one of these; those failures are logged
/// and skipped.
#[derive(Debug, Error)]
pub enum LabError {
    /// The container daemon cannot be reached at all.
    #[error("Docker unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    /// Attempted mutation of an infrastructure container.
    #[error("Refusing to mutate protected infrastructure container {0}")]
    Protected(String),

    /// Any other daemon-side failure during a request.
    #[error("{0}")]
    Runtime(String),
}

pub type LabResult<T> = Result<T, LabError>;

/// Returns true when the daemon answered 404 for the referenced object.
pub fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Returns true when the error came from the transport rather than the daemon.
pub fn is_connection_error(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::IOError { .. }
            | DockerError::HyperResponseError { .. }
            | DockerError::RequestTimeoutError
    )
}

impl From<DockerError> for LabError {
    fn from(err: DockerError) -> Self {
        if is_connection_error(&err) {
            LabError::RuntimeUnavailable(err.to_string())
        } else if is_not_found(&err) {
            LabError::NotFound(docker_message(&err))
        } else {
            LabError::Runtime(docker_message(&err))
        }
    }
}

fn docker_message(err: &DockerError) -> String {
    match err {
        DockerError::DockerResponseServerError { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

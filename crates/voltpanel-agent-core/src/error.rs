use std::path::PathBuf;
use thiserror::Error;

/// Errors returned synchronously by supervisor operations
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Process already running: {0}")]
    AlreadyRunning(String),

    #[error("Unknown process: {0}")]
    NotFound(String),

    #[error("Failed to spawn process {id}: {source}")]
    SpawnFailed {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process {0} has no addressable OS process")]
    NoProcessHandle(String),

    #[error("Failed to terminate process {id}: {reason}")]
    TerminateFailed { id: String, reason: String },

    #[error("Log for process {id} is unavailable: {source}")]
    LogUnavailable {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl SupervisorError {
    /// Errors a caller may see go away by trying again shortly.
    ///
    /// `AlreadyRunning` is transient right after a stop: the kill signal has been
    /// sent but the wait task has not recorded the exit yet.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SupervisorError::AlreadyRunning(_))
    }

    /// Errors caused by the request itself rather than the host
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SupervisorError::InvalidRequest(_)
                | SupervisorError::AlreadyRunning(_)
                | SupervisorError::NotFound(_)
        )
    }
}

/// Errors raised while loading or persisting the process registry
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Failed to read registry {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write registry {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Registry {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize registry: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SupervisorError::AlreadyRunning("web".to_string());
        assert_eq!(format!("{error}"), "Process already running: web");

        let error = SupervisorError::SpawnFailed {
            id: "web".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        let display = format!("{error}");
        assert!(display.contains("Failed to spawn process web"));
        assert!(display.contains("no such file"));
    }

    #[test]
    fn test_error_categorization() {
        assert!(SupervisorError::AlreadyRunning("a".to_string()).is_retryable());
        assert!(!SupervisorError::NotFound("a".to_string()).is_retryable());
        assert!(!SupervisorError::NoProcessHandle("a".to_string()).is_retryable());

        assert!(SupervisorError::InvalidRequest("empty".to_string()).is_client_error());
        assert!(SupervisorError::NotFound("a".to_string()).is_client_error());
        assert!(
            !SupervisorError::TerminateFailed {
                id: "a".to_string(),
                reason: "EPERM".to_string()
            }
            .is_client_error()
        );
    }

    #[test]
    fn test_registry_error_converts() {
        let path = PathBuf::from("/tmp/apps.json");
        let error: SupervisorError = RegistryError::Write {
            path,
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        }
        .into();
        assert!(matches!(error, SupervisorError::Registry(_)));
        assert!(format!("{error}").contains("disk full"));
    }
}

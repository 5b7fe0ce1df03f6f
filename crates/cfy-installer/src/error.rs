use std::fmt;

/// Installation step an error happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Configuration,
    ConnectionCheck,
    Upload,
    Bootstrap,
    Registration,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Configuration => "configuration",
            Self::ConnectionCheck => "connection check",
            Self::Upload => "file upload",
            Self::Bootstrap => "bootstrap",
            Self::Registration => "agent registration",
        })
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad input, detected before any network I/O. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{phase} on {host} timed out")]
    Timeout { phase: Phase, host: String },

    #[error("{phase} on {host} failed: {message}")]
    Installer {
        phase: Phase,
        host: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("{validator} validation failed: {message}")]
    Validation {
        validator: &'static str,
        message: String,
    },
}

impl Error {
    pub fn installer(phase: Phase, host: &str, message: impl Into<String>) -> Self {
        Self::Installer {
            phase,
            host: host.to_string(),
            message: message.into(),
            source: None,
        }
    }

    /// Attach a cause to an [`Error::Installer`]. Other variants are returned as is.
    pub fn with_source(self, cause: impl Into<BoxError>) -> Self {
        match self {
            Self::Installer {
                phase,
                host,
                message,
                ..
            } => Self::Installer {
                phase,
                host,
                message,
                source: Some(cause.into()),
            },
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn installer_error_keeps_phase_host_and_cause() {
        let err = Error::installer(Phase::Upload, "10.0.0.5", "Uploading files to remote server failed.")
            .with_source(std::io::Error::other("broken pipe"));
        assert_eq!(
            err.to_string(),
            "file upload on 10.0.0.5 failed: Uploading files to remote server failed."
        );
        assert_eq!(err.source().unwrap().to_string(), "broken pipe");
    }

    #[test]
    fn timeout_display() {
        let err = Error::Timeout {
            phase: Phase::Bootstrap,
            host: "h".into(),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "bootstrap on h timed out");
    }
}

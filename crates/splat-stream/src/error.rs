//! Error types for the splat-stream crate.

use std::fmt;

/// Result type for splat-stream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while fetching, parsing or configuring streamed splats.
///
/// The per-frame streaming path never returns these: failed loads are
/// absorbed as "not yet available" and retried on the next poll.
#[derive(Debug)]
pub enum Error {
    /// HTTP request failed.
    Http {
        /// The URL that failed.
        url: String,
        /// The error message.
        message: String,
    },
    /// HTTP response had a non-success status code.
    HttpStatus {
        /// The URL that returned the error.
        url: String,
        /// The HTTP status code.
        status: u16,
    },
    /// Reading a local file failed.
    Io {
        /// The path that failed.
        path: String,
        /// The underlying error.
        source: std::io::Error,
    },
    /// JSON parsing failed.
    Json {
        /// Context for where the error occurred.
        context: &'static str,
        /// The underlying error.
        source: serde_json::Error,
    },
    /// The octree asset is structurally unusable.
    InvalidAsset {
        /// The asset URL.
        url: String,
        /// Description of what was invalid.
        detail: String,
    },
    /// A configuration value is out of range.
    InvalidConfig {
        /// The offending option name.
        option: &'static str,
        /// Description of what was invalid.
        detail: String,
    },
    /// Splat file payload could not be decoded.
    Decode {
        /// The file URL.
        url: String,
        /// Description of what was invalid.
        detail: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http { url, message } => {
                write!(f, "http request to {url} failed: {message}")
            }
            Error::HttpStatus { url, status } => {
                write!(f, "http request to {url} returned status {status}")
            }
            Error::Io { path, source } => write!(f, "failed to read {path}: {source}"),
            Error::Json { context, source } => {
                write!(f, "failed to parse {context}: {source}")
            }
            Error::InvalidAsset { url, detail } => {
                write!(f, "invalid octree asset {url}: {detail}")
            }
            Error::InvalidConfig { option, detail } => {
                write!(f, "invalid config option {option}: {detail}")
            }
            Error::Decode { url, detail } => write!(f, "failed to decode {url}: {detail}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            Error::Json { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json {
            context: "json",
            source: e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = Error::HttpStatus {
            url: "http://example.com/a.bin".to_string(),
            status: 404,
        };
        assert_eq!(
            err.to_string(),
            "http request to http://example.com/a.bin returned status 404"
        );

        let err = Error::InvalidConfig {
            option: "lodDistances",
            detail: "must not be empty".to_string(),
        };
        assert!(err.to_string().contains("lodDistances"));
    }

    #[test]
    fn test_json_error_has_source() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err = Error::from(json_err);
        assert!(std::error::Error::source(&err).is_some());
    }
}

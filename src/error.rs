use std::time::Duration;

use thiserror::Error;

/// Failures that end one resolution attempt. Nothing here is retried.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("snapshot service returned {status}: {body}")]
    SnapshotStatus { status: u16, body: String },

    #[error("snapshot service did not answer within {0:?}")]
    Timeout(Duration),

    #[error("snapshot transport error: {0}")]
    Transport(String),

    #[error("malformed snapshot payload: {0}")]
    Payload(String),

    #[error("snapshot worker exited without a result")]
    Aborted,
}

impl From<ureq::Error> for ResolveError {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::Status(status, response) => Self::SnapshotStatus {
                status,
                body: response.into_string().unwrap_or_default(),
            },
            ureq::Error::Transport(x) => Self::Transport(x.to_string()),
        }
    }
}

impl From<std::io::Error> for ResolveError {
    fn from(e: std::io::Error) -> Self {
        Self::Payload(e.to_string())
    }
}

impl From<serde_json::Error> for ResolveError {
    fn from(e: serde_json::Error) -> Self {
        Self::Payload(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum RestError {
    /// PostgREST could not find an RPC with the given signature.
    #[error("function {function} not found")]
    FunctionNotFound { function: String },

    #[error("{status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not decode response: {0}")]
    Decode(String),
}

impl RestError {
    pub fn from_ureq(function: &str, e: ureq::Error) -> Self {
        match e {
            ureq::Error::Status(status, response) => {
                let body = response.into_string().unwrap_or_default();
                if is_missing_function(status, &body) {
                    Self::FunctionNotFound {
                        function: function.to_string(),
                    }
                } else {
                    Self::Status { status, body }
                }
            }
            ureq::Error::Transport(x) => Self::Transport(x.to_string()),
        }
    }
}

/// PostgREST answers an RPC call whose argument list matches no function with
/// a 404 carrying `PGRST202`; older versions only say "Could not find the
/// function".
pub fn is_missing_function(status: u16, body: &str) -> bool {
    (status == 404 || status == 400)
        && (body.contains("PGRST202") || body.contains("Could not find the function"))
}

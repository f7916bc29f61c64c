use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Failures surfaced by the browser-control channel. Every remote call can
/// fail or time out; the channel never retries on its own.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("network error: {0}")]
    Network(String),

    #[error("remote call timed out: {0}")]
    Timeout(String),

    #[error("control API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("unexpected control payload: {0}")]
    Decode(String),
}

impl ChannelError {
    /// Transient infra failures qualify for the single intra-batch retry.
    /// API 4xx responses (bad tab index, unknown session) do not; the state
    /// they describe will not fix itself by retrying the same call.
    pub fn is_transient(&self) -> bool {
        match self {
            ChannelError::Network(_) | ChannelError::Timeout(_) => true,
            ChannelError::Api { status, .. } => *status >= 500,
            ChannelError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for ChannelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ChannelError::Timeout(err.to_string())
        } else {
            ChannelError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ChannelError::Network("reset".into()).is_transient());
        assert!(ChannelError::Timeout("30s".into()).is_transient());
        assert!(ChannelError::Api {
            status: 502,
            message: "bad gateway".into()
        }
        .is_transient());
        assert!(!ChannelError::Api {
            status: 404,
            message: "no such tab".into()
        }
        .is_transient());
        assert!(!ChannelError::Decode("not json".into()).is_transient());
    }
}

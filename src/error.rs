use thiserror::Error;

use crate::cloud::CloudError;
use crate::config::ConfigError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    /// The spot price could not be determined. Never retried.
    #[error("spot price query failed: {0}")]
    UpstreamQuery(String),

    #[error("address association answered with HTTP status {status}")]
    UnexpectedStatus { status: u16 },

    #[error("giving up on address association after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: CloudError,
    },

    #[error("spot request {request_id} still not active after {polls} polls")]
    PollLimit { request_id: String, polls: u32 },

    #[error("active spot request {0} has no instance id")]
    MissingInstance(String),

    #[error("failed to read user data from {path}: {source}")]
    UserData {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

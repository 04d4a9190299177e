use std::future::Future;

use crate::record::Record;

pub mod solr;
#[cfg(test)]
pub(crate) mod stub;

pub use solr::{SolrClient, TargetConfig};

/// What the store answered for an accepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure(i32),
}

impl Status {
    pub const SUCCESS_CODE: i32 = 0;

    pub fn from_code(code: i32) -> Self {
        if code == Self::SUCCESS_CODE {
            Status::Success
        } else {
            Status::Failure(code)
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Status::Success => Self::SUCCESS_CODE,
            Status::Failure(code) => *code,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

// The submission call itself did not produce a status.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request to {uri} failed: {source}")]
    Request {
        uri: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {uri} answered {status}: {body}")]
    Rejected {
        uri: String,
        status: u16,
        body: String,
    },
    #[error("unreadable response from {uri}: {reason}")]
    Decode { uri: String, reason: String },
}

// The store client could not be built. Fatal for the whole run.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("cannot build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("cannot reach {uri}: {source}")]
    Unreachable {
        uri: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("cluster status request to {uri} answered {status}: {body}")]
    Rejected {
        uri: String,
        status: u16,
        body: String,
    },
    #[error("unreadable cluster status from {uri}: {reason}")]
    Decode { uri: String, reason: String },
    #[error("collection {0} does not exist in the cluster")]
    UnknownCollection(String),
    #[error("collection {0} has no active replica on a live node")]
    NoActiveReplicas(String),
}

// The one capability the submission loop needs from the store. Implementations are
// shared between workers, so they must be usable through a shared reference.
pub trait StoreClient: Send + Sync + 'static {
    fn submit(&self, batch: &[Record]) -> impl Future<Output = Result<Status, TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(Status::from_code(0), Status::Success);
        assert_eq!(Status::from_code(500), Status::Failure(500));
        assert_eq!(Status::Failure(400).code(), 400);
        assert_eq!(Status::Success.to_string(), "0");
    }
}

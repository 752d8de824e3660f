use std::time::Duration;

use thiserror::Error;

/// Failure of a single upstream exchange.
#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dns protocol error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream answered http status {0}")]
    Status(u16),
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),
    #[error("response id {got} does not match request id {want}")]
    IdMismatch { want: u16, got: u16 },
    #[error("{0} outbound is not supported")]
    Unsupported(&'static str),
}

/// Errors surfaced by a group pipeline to the server layer.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("query must carry exactly one question, got {questions}")]
    MalformedQuery { questions: usize },
    #[error("upstream[{index}] failed: {source}")]
    Upstream {
        index: usize,
        #[source]
        source: OutboundError,
    },
    #[error("all {attempted} upstreams failed")]
    AllUpstreamsFailed { attempted: usize },
    #[error("group has no upstreams")]
    NoUpstreams,
    #[error("resolver is shutting down")]
    Shutdown,
}

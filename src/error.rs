//! Crawler error types.
//!
//! Neither error is fatal to a crawl: a [`ConnectionError`] turns into a
//! `CrawlResult` with `success_connection = false`, and a [`QueryError`] is
//! counted as an empty query by the bucket drainer.

use thiserror::Error;

/// Failure to establish a session with a peer.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("node advertises no usable address")]
    NoUsableAddress,

    #[error("session setup timed out")]
    Timeout,

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Failure of a single `find_node` query.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("query timed out")]
    Timeout,

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("query rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

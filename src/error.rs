//! Error types shared across the server.
//!
//! Lifecycle failures are returned to the embedding application as
//! [`ServerError`]. Everything that happens on behalf of a remote caller is
//! turned into an error response instead and never surfaces here.

use std::io;

use thiserror::Error;

/// Failure to start (or to set up) the automation server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("unable to listen, server already listening")]
    AlreadyListening,

    #[error("unable to listen to port {port}")]
    PortUnavailable {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("unable to listen to any port in {first}..={last}")]
    PortRangeExhausted { first: u16, last: u16 },

    #[error("unable to configure listening socket")]
    Listener(#[source] io::Error),

    #[error("unable to build connection runtime")]
    Runtime(#[source] io::Error),

    #[error("unable to start thread")]
    ThreadSpawn(#[source] io::Error),
}

/// Failure to hand a job to the worker pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The bounded queue is full. Jobs are rejected rather than queued.
    #[error("worker pool saturated")]
    Saturated,

    /// The pool has been shut down.
    #[error("worker pool closed")]
    Closed,
}

/// Failure to run work on the UI context.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UiError {
    #[error("ui context is no longer running")]
    Closed,

    /// The job was accepted but never reported back (it panicked or was dropped).
    #[error("ui job did not complete")]
    Abandoned,
}

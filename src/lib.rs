//! # tokio-pipeline-router
//!
//! A load-aware distribution stage for tokio processing pipelines.
//!
//! ## Architecture
//!
//! The [`DistributorStage`] sits inside a pipeline of [`Stage`]s. For each
//! inbound unit of work it asks its [`NodePolicy`] for a destination index:
//! index `0` means "process locally" (forward to the stage's own downstream),
//! a positive index resolves — lazily, once — to a persistent
//! [`NodeConnection`] to the least-loaded node reported by the injected
//! [`ClusterMembership`] snapshot.
//!
//! ```text
//! upstream ─▶ DistributorStage ─┬─▶ next stage (local path)
//!                               └─▶ NodeConnection ─▶ remote worker
//!                                        │  receive loop
//!                                        └────────────▶ CollectorStage
//! ```
//!
//! A new connection ships the sub-pipeline configuration (the descriptor
//! slice from just after the distributor through the named collector) and a
//! free-form parameter document as a two-frame handshake, so the remote side
//! can instantiate an equivalent sub-pipeline before any data arrives.

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use bytes::Bytes;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod codec;
pub mod connection;
pub mod membership;
pub mod pipeline;
pub mod policy;
pub mod router;
pub mod stage;
pub mod wire;

// Re-exports for convenience
pub use codec::{CodecRegistry, PayloadCodec, RawCodec, SlotCodecs};
pub use connection::{ConnectionState, ConnectionTimeouts, NodeConnection};
pub use membership::{select_candidate, ClusterMembership, NodeDescriptor, SharedMembership};
pub use pipeline::{PipelineSpec, SlotBinding, StageDescriptor};
pub use policy::{LocalPolicy, NodePolicy, SingleRemotePolicy};
pub use router::{DistributorConfig, DistributorStage};
pub use stage::{ChannelStage, CloseFlags, CollectorStage, Stage, StageTable};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for production log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`RouterError::Other`] if the global subscriber has already been
/// set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), RouterError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| RouterError::Other(format!("tracing init failed: {e}")))
}

/// Top-level routing errors.
///
/// Every fatal condition in the distribution subsystem maps to a variant
/// here. The subsystem is fail-fast: no variant triggers an implicit retry.
/// All variants implement `std::error::Error` via [`thiserror`].
#[derive(Error, Debug)]
pub enum RouterError {
    /// The node policy returned a negative destination index.
    #[error("node policy returned negative index {0}")]
    NegativeNodeIndex(i64),

    /// The configured collector stage name could not be resolved, either in
    /// the pipeline descriptor list or in the live stage table.
    #[error("collector stage '{0}' not found")]
    CollectorNotFound(String),

    /// A data message arrived before `process_config` ran.
    #[error("distributor not configured: process_config must run first")]
    NotConfigured,

    /// Opening the transport to a remote node failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Peer address the connect was attempted against.
        addr: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// One of the two handshake frames could not be sent.
    #[error("handshake with {addr} failed: {reason}")]
    Handshake {
        /// Peer address of the failed handshake.
        addr: String,
        /// What went wrong.
        reason: String,
    },

    /// A positive index resolved to "local" but local fallback is disabled.
    #[error("this node cannot be used for compute and no remote node is available")]
    NoRemoteCapacity,

    /// A unit could not be enqueued onto a downstream stage or a
    /// connection's outbound queue.
    #[error("failed to enqueue onto '{target}'")]
    Enqueue {
        /// Name of the stage or peer address that refused the unit.
        target: String,
    },

    /// The cached connection for this index has failed and is permanently
    /// dead; failed connections are never retried.
    #[error("connection for node index {index} is dead")]
    ConnectionDead {
        /// Destination index whose connection failed.
        index: i64,
    },

    /// Encoding or decoding a payload failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// An inbound or outbound frame exceeded the wire limit.
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Declared frame length.
        len: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// Pipeline or distributor configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// An operation exceeded its configured deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// An I/O operation on an established transport failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// One opaque unit of work flowing through the pipeline.
///
/// The distributor never inspects the payload; the `slot` tag identifies the
/// payload type and selects the codec used on the wire. Ownership is
/// single-writer: an envelope is moved into exactly one component on every
/// code path, including failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Payload type tag; doubles as the wire frame's slot identifier.
    pub slot: u16,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Envelope {
    /// Create an envelope from a slot tag and any byte-like payload.
    pub fn new(slot: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            slot,
            payload: payload.into(),
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_new_from_static_bytes() {
        let unit = Envelope::new(1000, &b"abc"[..]);
        assert_eq!(unit.slot, 1000);
        assert_eq!(unit.len(), 3);
        assert!(!unit.is_empty());
    }

    #[test]
    fn test_envelope_empty_payload() {
        let unit = Envelope::new(1000, Bytes::new());
        assert!(unit.is_empty());
        assert_eq!(unit.len(), 0);
    }

    #[test]
    fn test_error_display_includes_context() {
        let err = RouterError::CollectorNotFound("Collector".to_string());
        assert!(err.to_string().contains("Collector"));

        let err = RouterError::NegativeNodeIndex(-3);
        assert!(err.to_string().contains("-3"));

        let err = RouterError::FrameTooLarge { len: 10, max: 5 };
        assert!(err.to_string().contains("10"));
        assert!(err.to_string().contains('5'));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RouterError>();
    }

    #[test]
    fn test_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: RouterError = io.into();
        assert!(matches!(err, RouterError::Io(_)));
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        let _ = init_tracing();
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}

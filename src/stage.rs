//! # Stage: Pipeline Stage Contract
//!
//! ## Responsibility
//! Define the uniform process/configure/close contract every pipeline stage
//! implements, the name-indexed table used to resolve live stage instances,
//! and the two concrete stages the distributor composes with: a
//! channel-backed downstream stage and the result-collecting stage.
//!
//! ## Guarantees
//! - Object-safe: stages are held and invoked as `Arc<dyn Stage>`
//! - Uniform: local and remote results enter the collector the same way
//! - Thread-safe: all stage state uses atomics or interior locks
//!
//! ## NOT Responsible For
//! - Routing decisions (see: `router`, `policy`)
//! - Connection lifecycle (see: `connection`)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::{Envelope, RouterError};

/// Flags passed down the chain when a pipeline closes.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseFlags {
    /// When set, stages holding remote connections must drain and tear them
    /// down before propagating the close downstream.
    pub shutdown: bool,
}

impl CloseFlags {
    /// Full shutdown: drain and release all resources.
    pub const SHUTDOWN: CloseFlags = CloseFlags { shutdown: true };
    /// Propagate-only close: no connection teardown.
    pub const PROPAGATE: CloseFlags = CloseFlags { shutdown: false };
}

/// Uniform contract for one unit of the processing pipeline.
///
/// Implementations must be `Send + Sync`; a stage may be invoked
/// concurrently from more than one caller depending on the surrounding
/// pipeline's scheduling.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name, unique within its pipeline.
    fn name(&self) -> &str;

    /// Handle one unit of work. The unit is moved in; on error the stage
    /// has already released it.
    async fn process(&self, unit: Envelope) -> Result<(), RouterError>;

    /// Close the stage, then propagate to anything downstream of it.
    async fn close(&self, flags: CloseFlags) -> Result<(), RouterError>;

    /// Set a named runtime parameter.
    ///
    /// The default implementation rejects every key; stages opt in to the
    /// parameters they understand.
    ///
    /// # Errors
    ///
    /// [`RouterError::Config`] for unrecognized keys.
    fn set_parameter(&self, key: &str, _value: &str) -> Result<(), RouterError> {
        Err(RouterError::Config(format!(
            "stage '{}' has no parameter '{key}'",
            self.name()
        )))
    }
}

/// Name-indexed table of live stage handles.
///
/// Built once while the pipeline is being assembled, then used by the
/// distributor to resolve its collector by name — no downstream walking, no
/// runtime type inspection.
///
/// # Panics
///
/// This type never panics.
#[derive(Clone, Default)]
pub struct StageTable {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl std::fmt::Debug for StageTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.stages.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("StageTable").field("names", &names).finish()
    }
}

impl StageTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage under its own name, replacing any previous entry.
    pub fn insert(&mut self, stage: Arc<dyn Stage>) {
        self.stages.insert(stage.name().to_string(), stage);
    }

    /// Resolve a live stage by name.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(name).cloned()
    }

    /// Number of registered stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// A stage that hands every unit to an mpsc channel.
///
/// Serves as the distributor's downstream "next" stage: whoever owns the
/// receiver is the rest of the local chain.
///
/// # Panics
///
/// This type never panics.
pub struct ChannelStage {
    name: String,
    tx: mpsc::Sender<Envelope>,
}

impl ChannelStage {
    /// Create a stage and the receiver its units arrive on.
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl Stage for ChannelStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, unit: Envelope) -> Result<(), RouterError> {
        self.tx.send(unit).await.map_err(|_| RouterError::Enqueue {
            target: self.name.clone(),
        })
    }

    async fn close(&self, _flags: CloseFlags) -> Result<(), RouterError> {
        info!(stage = %self.name, "channel stage closed");
        Ok(())
    }
}

/// The stage that aggregates results from local and remote execution paths.
///
/// In its default mode the collector accumulates units and only releases
/// them when it closes, which suits a collector fed solely by its own
/// upstream. In **pass-through mode** — enabled by the distributor at
/// configuration time via `set_parameter("pass_through_mode", "true")` —
/// every unit is forwarded to the output channel immediately, which is what
/// externally produced (remotely returned) results require.
///
/// # Panics
///
/// This type never panics.
pub struct CollectorStage {
    name: String,
    pass_through: AtomicBool,
    held: Mutex<Vec<Envelope>>,
    tx: mpsc::Sender<Envelope>,
}

impl CollectorStage {
    /// Create a collector and the receiver its output arrives on.
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                name: name.into(),
                pass_through: AtomicBool::new(false),
                held: Mutex::new(Vec::new()),
                tx,
            },
            rx,
        )
    }

    /// Whether pass-through mode is enabled.
    pub fn pass_through_mode(&self) -> bool {
        self.pass_through.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Stage for CollectorStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, unit: Envelope) -> Result<(), RouterError> {
        if self.pass_through_mode() {
            return self.tx.send(unit).await.map_err(|_| RouterError::Enqueue {
                target: self.name.clone(),
            });
        }
        self.held.lock().await.push(unit);
        Ok(())
    }

    async fn close(&self, _flags: CloseFlags) -> Result<(), RouterError> {
        let held = std::mem::take(&mut *self.held.lock().await);
        debug!(stage = %self.name, held = held.len(), "collector releasing held units");
        for unit in held {
            self.tx.send(unit).await.map_err(|_| RouterError::Enqueue {
                target: self.name.clone(),
            })?;
        }
        Ok(())
    }

    fn set_parameter(&self, key: &str, value: &str) -> Result<(), RouterError> {
        if key == "pass_through_mode" {
            let enabled = value == "true";
            self.pass_through.store(enabled, Ordering::Release);
            info!(stage = %self.name, enabled, "pass-through mode set");
            return Ok(());
        }
        Err(RouterError::Config(format!(
            "stage '{}' has no parameter '{key}'",
            self.name
        )))
    }
}

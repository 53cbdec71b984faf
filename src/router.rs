//! # Stage: Distributor
//!
//! ## Responsibility
//! Sit in the middle of a pipeline and, for each unit, either hand it to
//! the next local stage or ship it to a remote worker running the
//! sub-pipeline between this stage and the collector. Owns the node map
//! (destination index → connection) and the configuration split.
//!
//! ## Guarantees
//! - Single flight: at most one connection is ever established per
//!   destination index, even under concurrent `process` calls
//! - Per-destination FIFO: units for the same index leave in arrival order
//! - Local fallback: when the cluster offers no better candidate than this
//!   node, units stay local (unless local compute is disabled)
//!
//! ## NOT Responsible For
//! - Deciding destination indices (see: `policy`)
//! - Cluster state tracking (see: `membership`)
//! - Transport mechanics (see: `connection`)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::codec::{CodecRegistry, SlotCodecs};
use crate::connection::{ConnectionState, ConnectionTimeouts, NodeConnection};
use crate::membership::{select_candidate, ClusterMembership};
use crate::policy::{LocalPolicy, NodePolicy};
use crate::stage::{CloseFlags, Stage, StageTable};
use crate::pipeline::PipelineSpec;
use crate::{Envelope, RouterError};

fn default_true() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

/// Distributor settings, deserialized from the stage's configuration block.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DistributorConfig {
    /// Name of the collector stage that terminates the distributed span.
    /// Must appear after the distributor in the pipeline.
    pub collector: String,

    /// When false, units the cluster cannot place remotely are rejected
    /// instead of processed locally.
    #[serde(default = "default_true")]
    pub use_this_node_for_compute: bool,

    /// Deadline for opening a worker transport.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Deadline covering both handshake frames.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Deadline for draining a connection's outbound queue at shutdown.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl DistributorConfig {
    /// Per-connection deadlines derived from the millisecond fields.
    fn timeouts(&self) -> ConnectionTimeouts {
        ConnectionTimeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            handshake: Duration::from_millis(self.handshake_timeout_ms),
            drain: Duration::from_millis(self.drain_timeout_ms),
        }
    }
}

/// Everything `process_config` derives once and every later call reuses.
struct Setup {
    /// Serialized sub-pipeline shipped to each new worker.
    sub_toml: String,
    /// Parameter document shipped as the second handshake frame.
    parameters: String,
    /// Slot → codec bindings for the sub-pipeline's traffic.
    codecs: SlotCodecs,
    /// Collector stage, switched to pass-through mode.
    collector: Arc<dyn Stage>,
}

/// Route decided for one unit while the node map lock was held.
enum Route {
    Local,
    Remote(Arc<NodeConnection>),
}

/// Pipeline stage that fans work units out across a cluster.
///
/// Connections are created lazily: the first unit carrying a given
/// destination index pays for candidate selection, connect, and handshake;
/// every later unit for that index reuses the cached entry. An index whose
/// selection returned this node itself is cached as a local marker so the
/// cluster is not re-queried per unit.
pub struct DistributorStage {
    name: String,
    config: DistributorConfig,
    policy: Arc<dyn NodePolicy>,
    membership: Arc<dyn ClusterMembership>,
    registry: CodecRegistry,
    next: Arc<dyn Stage>,
    stages: StageTable,
    setup: RwLock<Option<Setup>>,
    /// Destination index → connection; `None` marks a locally-routed index.
    /// The map lock is held across connection establishment, which is what
    /// makes creation single-flight.
    nodes: Mutex<HashMap<i64, Option<Arc<NodeConnection>>>>,
}

impl DistributorStage {
    /// Create a distributor with the default (always-local) policy and the
    /// built-in codec registry.
    pub fn new(
        name: impl Into<String>,
        config: DistributorConfig,
        membership: Arc<dyn ClusterMembership>,
        next: Arc<dyn Stage>,
        stages: StageTable,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            policy: Arc::new(LocalPolicy),
            membership,
            registry: CodecRegistry::new(),
            next,
            stages,
            setup: RwLock::new(None),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the routing policy.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn NodePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the codec registry used to bind sub-pipeline slots.
    #[must_use]
    pub fn with_registry(mut self, registry: CodecRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Ingest the full pipeline description and the parameter document.
    ///
    /// Validates the pipeline, slices out the sub-chain from just after
    /// this stage through the configured collector, binds codecs for its
    /// slots, and flips the local collector into pass-through mode so that
    /// remotely-produced results flow straight through it.
    ///
    /// Must complete before eager connection establishment is possible;
    /// until it does, any unit routed to a remote index fails with
    /// [`RouterError::NotConfigured`].
    ///
    /// # Errors
    ///
    /// [`RouterError::Config`] for an invalid pipeline,
    /// [`RouterError::CollectorNotFound`] if the collector is missing from
    /// the pipeline or the stage table, [`RouterError::Codec`] for an
    /// unregistered codec name.
    pub async fn process_config(
        &self,
        pipeline_toml: &str,
        parameters: &str,
    ) -> Result<(), RouterError> {
        let spec = PipelineSpec::from_toml(pipeline_toml)?;
        spec.validate()?;

        let sub = spec.sub_chain(&self.name, &self.config.collector)?;
        let sub_toml = sub.to_toml()?;
        let codecs = SlotCodecs::from_spec(&sub, &self.registry)?;

        let collector = self
            .stages
            .resolve(&self.config.collector)
            .ok_or_else(|| RouterError::CollectorNotFound(self.config.collector.clone()))?;
        collector.set_parameter("pass_through_mode", "true")?;

        info!(
            stage = %self.name,
            collector = %self.config.collector,
            sub_stages = sub.stages.len(),
            "distributor configured"
        );

        let mut setup = self.setup.write().await;
        *setup = Some(Setup {
            sub_toml,
            parameters: parameters.to_string(),
            codecs,
            collector,
        });
        Ok(())
    }

    /// Establish the connection for `index`, or record that the cluster
    /// placed it on this node. Caller holds the node map lock.
    async fn resolve_route(
        &self,
        index: i64,
        map: &mut HashMap<i64, Option<Arc<NodeConnection>>>,
    ) -> Result<Route, RouterError> {
        let setup = self.setup.read().await;
        let setup = setup.as_ref().ok_or(RouterError::NotConfigured)?;

        let candidate = select_candidate(self.membership.as_ref());
        if candidate.is_local() {
            debug!(stage = %self.name, index, "no better candidate than this node");
            map.insert(index, None);
            return Ok(Route::Local);
        }

        let mut conn = NodeConnection::new(
            &candidate.address,
            candidate.port,
            setup.codecs.clone(),
            Arc::clone(&setup.collector),
            self.config.timeouts(),
        );
        conn.open().await?;
        conn.handshake(&setup.sub_toml, &setup.parameters).await?;

        info!(
            stage = %self.name,
            index,
            peer = %conn.peer(),
            id = %conn.id(),
            "worker connection established"
        );
        let conn = Arc::new(conn);
        map.insert(index, Some(Arc::clone(&conn)));
        Ok(Route::Remote(conn))
    }
}

#[async_trait]
impl Stage for DistributorStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, unit: Envelope) -> Result<(), RouterError> {
        let index = self.policy.node_index(&unit, self.membership.as_ref());
        if index < 0 {
            return Err(RouterError::NegativeNodeIndex(index));
        }
        if index == 0 {
            return self.next.process(unit).await;
        }

        let route = {
            let mut map = self.nodes.lock().await;
            match map.get(&index).cloned() {
                Some(Some(conn)) => Route::Remote(conn),
                Some(None) => Route::Local,
                // Establishment failure leaves no entry behind; the next
                // unit for this index triggers a fresh attempt.
                None => self.resolve_route(index, &mut map).await?,
            }
        };

        match route {
            Route::Local => {
                if !self.config.use_this_node_for_compute {
                    return Err(RouterError::NoRemoteCapacity);
                }
                self.next.process(unit).await
            }
            Route::Remote(conn) => {
                if conn.state() == ConnectionState::Failed {
                    return Err(RouterError::ConnectionDead { index });
                }
                conn.enqueue(unit)
            }
        }
    }

    async fn close(&self, flags: CloseFlags) -> Result<(), RouterError> {
        let mut first_error = None;
        if flags.shutdown {
            let drained = std::mem::take(&mut *self.nodes.lock().await);
            for (index, entry) in drained {
                if let Some(conn) = entry {
                    if let Err(e) = conn.close().await {
                        warn!(stage = %self.name, index, error = %e, "connection close failed");
                        first_error.get_or_insert(e);
                    }
                }
            }
            info!(stage = %self.name, "all worker connections released");
        }

        self.next.close(flags).await?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

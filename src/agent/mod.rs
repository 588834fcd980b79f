//! The reconciliation agent: tick scheduling, change detection, and the
//! optional registry clean pass.
//!
//! All mutable bookkeeping (the persisted state plus the in-memory
//! last-register timestamps) lives behind one mutex that is held for the
//! duration of a cycle or a clean pass, so the two never interleave and the
//! reconciler stays the single writer.

pub mod reconcile;
pub mod sidecar;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::{Config, MANAGED_BY};
use crate::metrics::Metrics;
use crate::registry::RegistryAgent;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::state::{self, State};

/// Minimum wall-clock gap between cycle completion and the next start.
pub const TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Budget for one full reconcile cycle.
pub const CYCLE_BUDGET: Duration = Duration::from_secs(30);

/// Unchanged services are re-registered anyway after this long.
pub const REREGISTER_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Ways a whole cycle can fail. Per-service errors are logged and counted
/// instead.
#[derive(Debug, Error)]
pub enum CycleError {
    /// The container listing failed; nothing could be reconciled.
    #[error("container listing failed: {0}")]
    Listing(#[from] RuntimeError),

    /// The cycle exceeded its time budget.
    #[error("reconcile cycle exceeded its {0:?} budget")]
    Deadline(Duration),
}

/// Mutable bookkeeping owned by the reconciler.
pub(crate) struct Bookkeeping {
    pub state: State,
    pub last_register: HashMap<String, Instant>,
}

/// The reconciliation agent.
pub struct Agent {
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) registry: Arc<dyn RegistryAgent>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) config: Config,
    pub(crate) books: tokio::sync::Mutex<Bookkeeping>,
}

impl Agent {
    /// Create an agent, reloading any prior state crib from disk.
    pub async fn new(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<dyn RegistryAgent>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let state = state::load(&config.state_path).await;
        if !state.services.is_empty() {
            tracing::info!(
                services = state.services.len(),
                "reloaded prior state from {}",
                config.state_path
            );
        }
        Self {
            runtime,
            registry,
            metrics,
            config,
            books: tokio::sync::Mutex::new(Bookkeeping {
                state,
                last_register: HashMap::new(),
            }),
        }
    }

    /// Run one reconcile cycle under the cycle budget.
    pub async fn run_once(&self) -> Result<(), CycleError> {
        let mut books = self.books.lock().await;
        match tokio::time::timeout(CYCLE_BUDGET, self.cycle(&mut books)).await {
            Ok(result) => result,
            Err(_) => {
                self.metrics.errors.inc();
                Err(CycleError::Deadline(CYCLE_BUDGET))
            }
        }
    }

    /// Run until a shutdown signal arrives. The signal interrupts the
    /// between-tick sleep, never a cycle in flight.
    pub async fn run(self: Arc<Self>) {
        if let Some(interval) = self.config.clean_interval {
            let agent = Arc::clone(&self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // the first tick fires immediately
                loop {
                    ticker.tick().await;
                    agent.clean_pass().await;
                }
            });
            tracing::info!(interval_secs = interval.as_secs(), "clean pass enabled");
        }

        loop {
            if let Err(e) = self.run_once().await {
                tracing::error!("reconcile cycle failed: {e}");
            }
            tokio::select! {
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
                _ = shutdown_signal() => {
                    tracing::info!("shutdown signal received");
                    return;
                }
            }
        }
    }

    /// Deregister engine-owned registry entries whose backing container is
    /// gone. Holds the bookkeeping lock to serialize with the main cycle,
    /// but only mutates the registry, never local state.
    pub async fn clean_pass(&self) {
        let _books = self.books.lock().await;

        let services = match self.registry.services().await {
            Ok(services) => services,
            Err(e) => {
                self.metrics.errors.inc();
                tracing::warn!("clean pass: service listing failed: {e}");
                return;
            }
        };

        for (id, info) in services {
            if info.meta.get("managed-by").map(String::as_str) != Some(MANAGED_BY) {
                continue;
            }
            if info
                .meta
                .get("agent-id")
                .is_some_and(|a| a != &self.config.agent_id)
            {
                continue;
            }
            let Some((container_id, _)) = id.split_once(':') else {
                continue;
            };
            match self.runtime.exists(container_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(service = %id, "clean pass: backing container gone, deregistering");
                    if let Err(e) = self
                        .registry
                        .deregister(&id, &info.namespace, &info.partition)
                        .await
                    {
                        self.metrics.errors.inc();
                        tracing::warn!(service = %id, "clean pass: deregister failed: {e}");
                    }
                }
                Err(e) => {
                    self.metrics.errors.inc();
                    tracing::warn!(service = %id, "clean pass: existence check failed: {e}");
                }
            }
        }
    }

    /// Snapshot the persisted state, for tests and introspection.
    pub async fn state_snapshot(&self) -> State {
        self.books.lock().await.state.clone()
    }
}

/// Resolves when the process receives SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// SHA-256 of the canonical serialized payload. Map keys are ordered, so
/// the same payload always produces the same hex digest.
pub fn fingerprint(payload: &Map<String, Value>) -> String {
    let Ok(bytes) = serde_json::to_vec(payload) else {
        return String::new();
    };
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

/// The register / skip decision for one identity.
pub(crate) fn should_register(books: &Bookkeeping, identity: &str, fingerprint: &str) -> bool {
    if !books.state.services.get(identity).copied().unwrap_or(false) {
        return true;
    }
    match books.state.service_hashes.get(identity) {
        Some(prev) if prev == fingerprint => {}
        _ => return true,
    }
    match books.last_register.get(identity) {
        Some(at) => at.elapsed() >= REREGISTER_INTERVAL,
        None => true,
    }
}

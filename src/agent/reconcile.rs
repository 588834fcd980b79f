//! One end-to-end reconcile cycle.
//!
//! Ordering guarantees, per identity: register precedes sidecar launch;
//! deregister precedes sidecar removal. Within a container, labels are
//! processed in sorted key order. Per-container and per-label failures are
//! logged, counted, and skipped; only the initial container listing can
//! fail the cycle as a whole.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::agent::{fingerprint, should_register, sidecar, Agent, Bookkeeping, CycleError};
use crate::label::parse_service_label;
use crate::payload::{normalize, NormalizeContext};
use crate::runtime::{ContainerSummary, CreateOutcome};
use crate::state;

/// Prefix of a label exposing a service.
const SERVICE_LABEL_PREFIX: &str = "consul.service.";
/// Prefix of a label opting a service into sidecar launch.
const SIDECAR_LABEL_PREFIX: &str = "consul.sidecar.";

impl Agent {
    pub(crate) async fn cycle(&self, books: &mut Bookkeeping) -> Result<(), CycleError> {
        let containers = match self.runtime.list_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                self.metrics.errors.inc();
                return Err(CycleError::Listing(e));
            }
        };
        self.metrics.containers.set(containers.len() as i64);
        tracing::debug!(containers = containers.len(), "reconcile start");

        let sidecars = sidecar::index(&containers);
        let mut seen: HashSet<String> = HashSet::new();
        let mut launched: i64 = 0;

        for container in &containers {
            if sidecar::is_sidecar(&container.labels) {
                continue;
            }
            let details = match self.runtime.inspect(&container.id).await {
                Ok(details) => details,
                Err(e) => {
                    self.metrics.errors.inc();
                    tracing::warn!(container = %container.id, "inspect failed: {e}");
                    continue;
                }
            };

            let mut keys: Vec<String> = Vec::new();
            for key in details.labels.keys() {
                if key.starts_with(SERVICE_LABEL_PREFIX) {
                    keys.push(key.clone());
                } else if key == "consul.service" {
                    tracing::warn!(
                        container = %details.id,
                        "label 'consul.service' is not supported, use 'consul.service.<name>'"
                    );
                }
            }
            keys.sort();

            for key in &keys {
                let suffix = &key[SERVICE_LABEL_PREFIX.len()..];
                let raw = match parse_service_label(&details.labels[key.as_str()]) {
                    Ok(raw) => raw,
                    Err(e) => {
                        self.metrics.errors.inc();
                        tracing::warn!(container = %details.id, label = %key, "label parse failed: {e}");
                        continue;
                    }
                };

                let sidecar_requested = details
                    .labels
                    .contains_key(&format!("{SIDECAR_LABEL_PREFIX}{suffix}"));

                let ctx = NormalizeContext {
                    container_id: &details.id,
                    container_name: &details.name,
                    network_ips: &details.network_ips,
                    label_suffix: suffix,
                    sidecar_requested,
                    sidecar: &self.config.sidecar,
                    agent_id: &self.config.agent_id,
                };
                let service = match normalize(raw, &ctx) {
                    Ok(service) => service,
                    Err(e) => {
                        self.metrics.errors.inc();
                        tracing::warn!(container = %details.id, label = %key, "service rejected: {e}");
                        continue;
                    }
                };

                seen.insert(service.identity.clone());
                let digest = fingerprint(&service.payload);

                if should_register(books, &service.identity, &digest) {
                    match self.registry.register(&service.payload).await {
                        Ok(()) => {
                            books.state.services.insert(service.identity.clone(), true);
                            books
                                .state
                                .service_hashes
                                .insert(service.identity.clone(), digest);
                            books
                                .last_register
                                .insert(service.identity.clone(), Instant::now());
                            tracing::info!(
                                container = %details.id,
                                service = %service.name,
                                id = %service.identity,
                                "registered service"
                            );
                        }
                        Err(e) => {
                            // State stays untouched; no sidecar for a
                            // service that failed to register.
                            self.metrics.errors.inc();
                            tracing::warn!(
                                container = %details.id,
                                service = %service.name,
                                "register failed: {e}"
                            );
                            continue;
                        }
                    }
                } else {
                    books.state.services.insert(service.identity.clone(), true);
                }

                if sidecar_requested {
                    self.ensure_sidecar(&details.id, &service, &sidecars, &mut launched)
                        .await;
                }
            }
        }

        // Deregister before sidecar removal, so a proxied identity never
        // outlives its registration.
        let stale: Vec<String> = books
            .state
            .services
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for identity in stale {
            match self.registry.deregister(&identity, "", "").await {
                Ok(()) => {
                    books.state.services.remove(&identity);
                    books.state.service_hashes.remove(&identity);
                    books.last_register.remove(&identity);
                    tracing::info!(id = %identity, "deregistered stale service");
                }
                Err(e) => {
                    // Stays in state; retried next tick.
                    self.metrics.errors.inc();
                    tracing::warn!(id = %identity, "deregister failed: {e}");
                }
            }
        }

        let mut deleted: i64 = 0;
        for (identity, container) in &sidecars {
            if seen.contains(identity) {
                continue;
            }
            tracing::info!(container = %container.id, id = %identity, "removing orphan sidecar");
            match self.runtime.remove(&container.id).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    self.metrics.errors.inc();
                    tracing::warn!(container = %container.id, "orphan sidecar removal failed: {e}");
                }
            }
        }

        self.metrics.services_registered.set(books.state.services.len() as i64);
        self.metrics.sidecars_launched.set(launched);
        self.metrics.sidecars_deleted.set(deleted);
        self.metrics.cycles.inc();

        if let Err(e) = state::save(&self.config.state_path, &books.state).await {
            self.metrics.errors.inc();
            tracing::warn!(path = %self.config.state_path, "state persist failed: {e}");
        }
        tracing::debug!(services = books.state.services.len(), "reconcile complete");
        Ok(())
    }

    /// Drive one identity's sidecar toward running: start it if it exists
    /// but stopped, launch it if absent, or log why the engine cannot.
    async fn ensure_sidecar(
        &self,
        parent_id: &str,
        service: &crate::payload::NormalizedService,
        sidecars: &HashMap<String, ContainerSummary>,
        launched: &mut i64,
    ) {
        if !self.config.sidecar.enabled {
            tracing::debug!(
                id = %service.identity,
                "sidecar requested but SIDECAR_ENABLED is off"
            );
            return;
        }
        if !self.config.sidecar.launchable() {
            tracing::warn!(
                id = %service.identity,
                "sidecar requested but SIDECAR_IMAGE or consul HTTP/gRPC endpoints are missing"
            );
            return;
        }

        if let Some(existing) = sidecars.get(&service.identity) {
            if existing.state != "running" {
                if let Err(e) = self.runtime.start(&existing.id).await {
                    self.metrics.errors.inc();
                    tracing::warn!(container = %existing.id, "sidecar restart failed: {e}");
                }
            }
            return;
        }

        let request = sidecar::launch_request(
            parent_id,
            &service.name,
            &service.identity,
            &self.config.sidecar,
            service.transparent_proxy,
        );
        match self.runtime.create(&request).await {
            Ok(CreateOutcome::Created(container_id)) => {
                match self.runtime.start(&container_id).await {
                    Ok(()) => {
                        *launched += 1;
                        tracing::info!(
                            id = %service.identity,
                            container = %container_id,
                            transparent_proxy = service.transparent_proxy,
                            "sidecar launched"
                        );
                    }
                    Err(e) => {
                        self.metrics.errors.inc();
                        tracing::warn!(id = %service.identity, "sidecar start failed: {e}");
                    }
                }
            }
            Ok(CreateOutcome::AlreadyExists) => {
                // Name collision from an earlier run; make sure it runs.
                if let Err(e) = self.runtime.start(&request.name).await {
                    self.metrics.errors.inc();
                    tracing::warn!(container = %request.name, "sidecar start failed: {e}");
                }
            }
            Err(e) => {
                self.metrics.errors.inc();
                tracing::warn!(id = %service.identity, "sidecar create failed: {e}");
            }
        }
    }
}

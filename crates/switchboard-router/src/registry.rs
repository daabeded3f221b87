//! Agent registry: who is running, where, and whether they are still alive

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{AgentId, AgentRecord, AgentStatus, Error, RegistryConfig, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_HEARTBEAT_TIMEOUT_SECS: i64 = 45;

pub struct AgentRegistry {
    agents: DashMap<AgentId, AgentRecord>,
    heartbeat_timeout: chrono::Duration,
}

impl AgentRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        let heartbeat_timeout = chrono::Duration::from_std(heartbeat_timeout).unwrap_or_else(|_| {
            warn!(
                "Heartbeat timeout {:?} out of range, using {}s",
                heartbeat_timeout, DEFAULT_HEARTBEAT_TIMEOUT_SECS
            );
            chrono::Duration::seconds(DEFAULT_HEARTBEAT_TIMEOUT_SECS)
        });
        Self {
            agents: DashMap::new(),
            heartbeat_timeout,
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(config.heartbeat_timeout())
    }

    pub fn register(
        &self,
        id: impl Into<AgentId>,
        address: &str,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<AgentRecord> {
        self.register_at(id, address, capabilities, Utc::now())
    }

    /// Idempotent upsert. A re-registration resets the agent to `starting` and
    /// keeps its original `registered_at`.
    pub fn register_at(
        &self,
        id: impl Into<AgentId>,
        address: &str,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        now: DateTime<Utc>,
    ) -> Result<AgentRecord> {
        validate_address(address)?;
        let id = id.into();
        let mut record = AgentRecord::new(id.clone(), address, capabilities);
        record.last_heartbeat = now;
        record.registered_at = now;

        let record = match self.agents.entry(id.clone()) {
            Entry::Occupied(mut existing) => {
                record.registered_at = existing.get().registered_at;
                existing.insert(record.clone());
                record
            }
            Entry::Vacant(slot) => slot.insert(record).clone(),
        };
        info!(
            "Agent registered: {} at {} [{}]",
            id,
            record.address,
            record.capabilities.iter().cloned().collect::<Vec<_>>().join(", ")
        );
        Ok(record)
    }

    pub fn heartbeat(&self, id: &AgentId) -> Result<()> {
        self.heartbeat_at(id, Utc::now())
    }

    /// Refresh liveness. Unknown and expired agents get `AgentNotFound` and must re-register.
    pub fn heartbeat_at(&self, id: &AgentId, now: DateTime<Utc>) -> Result<()> {
        match self.agents.get_mut(id) {
            Some(mut record) if record.status.is_routable() => {
                if record.status == AgentStatus::Starting {
                    debug!("Agent {} is now healthy", id);
                }
                record.status = AgentStatus::Healthy;
                record.last_heartbeat = now;
                Ok(())
            }
            _ => Err(Error::AgentNotFound(id.to_string())),
        }
    }

    /// Routable lookup. Unhealthy agents are reported as not found.
    pub fn get(&self, id: &AgentId) -> Result<AgentRecord> {
        self.agents
            .get(id)
            .filter(|r| r.status.is_routable())
            .map(|r| r.clone())
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))
    }

    /// Last known record regardless of status, for diagnostics.
    pub fn inspect(&self, id: &AgentId) -> Option<AgentRecord> {
        self.agents.get(id).map(|r| r.clone())
    }

    pub fn list_by_capability(&self, tag: &str) -> Vec<AgentRecord> {
        self.collect(|r| r.status.is_routable() && r.has_capability(tag))
    }

    pub fn list_routable(&self) -> Vec<AgentRecord> {
        self.collect(|r| r.status.is_routable())
    }

    pub fn list_all(&self) -> Vec<AgentRecord> {
        self.collect(|_| true)
    }

    pub fn deregister(&self, id: &AgentId) -> bool {
        let removed = self.agents.remove(id).is_some();
        if removed {
            info!("Agent deregistered: {}", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Mark every agent whose heartbeat is older than the timeout as unhealthy.
    /// Returns the ids that changed state.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<AgentId> {
        let mut expired = Vec::new();
        for mut entry in self.agents.iter_mut() {
            let record = entry.value_mut();
            if record.status.is_routable() && now - record.last_heartbeat > self.heartbeat_timeout {
                record.status = AgentStatus::Unhealthy;
                expired.push(record.id.clone());
            }
        }
        for id in &expired {
            warn!("Agent {} missed heartbeats, marked unhealthy", id);
        }
        expired
    }

    /// Run `sweep_at` on a fixed interval until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep_at(Utc::now());
                    }
                }
            }
            debug!("Registry sweeper stopped");
        })
    }

    fn collect(&self, keep: impl Fn(&AgentRecord) -> bool) -> Vec<AgentRecord> {
        let mut records: Vec<AgentRecord> = self
            .agents
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| e.value().clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}

/// Accept `host:port` with an explicit numeric port and nothing else.
pub fn validate_address(address: &str) -> Result<()> {
    let (_, port) = address
        .rsplit_once(':')
        .ok_or_else(|| Error::invalid_address(address, "missing port"))?;
    port.parse::<u16>()
        .map_err(|_| Error::invalid_address(address, "port is not a number"))?;

    let url = url::Url::parse(&format!("ws://{}", address))
        .map_err(|e| Error::invalid_address(address, e.to_string()))?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(Error::invalid_address(address, "missing host"));
    }
    if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
        return Err(Error::invalid_address(address, "unexpected path or query"));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(Error::invalid_address(address, "credentials are not allowed"));
    }
    Ok(())
}

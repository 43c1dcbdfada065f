use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    Tcp,
    Udp,
    Edge,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowInfo {
    pub id: String,
    pub kind: FlowKind,
    pub client: String,
    pub dest: String,
    pub started_at_unix_ms: u64,
}

/// Live flows, keyed by flow id. Backs the admin `/conns` endpoint.
#[derive(Debug, Default)]
pub struct FlowRegistry {
    flows: DashMap<String, FlowInfo>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, f: FlowInfo) {
        self.flows.insert(f.id.clone(), f);
    }

    pub fn remove(&self, id: &str) {
        self.flows.remove(id);
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn snapshot(&self) -> Vec<FlowInfo> {
        let mut out: Vec<FlowInfo> = self.flows.iter().map(|f| f.value().clone()).collect();
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }
}

pub type SharedFlows = Arc<FlowRegistry>;

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_flow_id(prefix: &str) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}{n}")
}

/// Registers a flow for its lifetime and maintains the active-flow gauge.
pub struct FlowGuard {
    id: String,
    registry: SharedFlows,
}

impl FlowGuard {
    pub fn register(registry: &SharedFlows, kind: FlowKind, client: String, dest: String) -> Self {
        let prefix = match kind {
            FlowKind::Tcp => "t",
            FlowKind::Udp => "u",
            FlowKind::Edge => "e",
        };
        let id = new_flow_id(prefix);
        registry.add(FlowInfo {
            id: id.clone(),
            kind,
            client,
            dest,
            started_at_unix_ms: now_unix_ms(),
        });
        metrics::gauge!("edgetun_active_flows").increment(1.0);
        Self {
            id,
            registry: registry.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
        metrics::gauge!("edgetun_active_flows").decrement(1.0);
    }
}

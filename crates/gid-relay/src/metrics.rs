use prometheus::{
    register_counter_with_registry, register_gauge_with_registry, Counter, Gauge, Registry,
};
use std::sync::Arc;

pub struct RelayMetrics {
    pub registered_agents: Gauge,
    pub online_agents: Gauge,
    pub queued_envelopes: Gauge,
    pub envelopes_delivered: Counter,
    pub envelopes_buffered: Counter,
    pub envelopes_dropped: Counter,
    pub envelopes_rejected: Counter,
    pub signals_dropped: Counter,
    pub malformed_frames: Counter,
    pub registrations_rejected: Counter,
    pub connections_evicted: Counter,
    pub registry: Arc<Registry>,
}

impl RelayMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let registered_agents = register_gauge_with_registry!(
            "gid_relay_registered_agents",
            "Number of agents known to the directory",
            registry
        )?;

        let online_agents = register_gauge_with_registry!(
            "gid_relay_online_agents",
            "Number of agents with a live connection",
            registry
        )?;

        let queued_envelopes = register_gauge_with_registry!(
            "gid_relay_queued_envelopes",
            "Envelopes waiting in offline mailboxes",
            registry
        )?;

        let envelopes_delivered = register_counter_with_registry!(
            "gid_relay_envelopes_delivered_total",
            "Envelopes handed to a live connection",
            registry
        )?;

        let envelopes_buffered = register_counter_with_registry!(
            "gid_relay_envelopes_buffered_total",
            "Envelopes stored for an offline recipient",
            registry
        )?;

        let envelopes_dropped = register_counter_with_registry!(
            "gid_relay_envelopes_dropped_total",
            "Envelopes refused by mailbox limits",
            registry
        )?;

        let envelopes_rejected = register_counter_with_registry!(
            "gid_relay_envelopes_rejected_total",
            "Envelopes addressed to unknown agents",
            registry
        )?;

        let signals_dropped = register_counter_with_registry!(
            "gid_relay_signals_dropped_total",
            "Typing and receipt signals dropped because the target was offline",
            registry
        )?;

        let malformed_frames = register_counter_with_registry!(
            "gid_relay_malformed_frames_total",
            "Frames that failed to parse or were not valid in context",
            registry
        )?;

        let registrations_rejected = register_counter_with_registry!(
            "gid_relay_registrations_rejected_total",
            "Connections closed during registration",
            registry
        )?;

        let connections_evicted = register_counter_with_registry!(
            "gid_relay_connections_evicted_total",
            "Connections closed because their outbound queue stayed full",
            registry
        )?;

        Ok(Self {
            registered_agents,
            online_agents,
            queued_envelopes,
            envelopes_delivered,
            envelopes_buffered,
            envelopes_dropped,
            envelopes_rejected,
            signals_dropped,
            malformed_frames,
            registrations_rejected,
            connections_evicted,
            registry,
        })
    }

    pub fn export_prometheus(&self) -> anyhow::Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_counters() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.envelopes_buffered.inc();
        metrics.online_agents.set(2.0);

        let text = metrics.export_prometheus().unwrap();
        assert!(text.contains("gid_relay_envelopes_buffered_total 1"));
        assert!(text.contains("gid_relay_online_agents 2"));
    }
}

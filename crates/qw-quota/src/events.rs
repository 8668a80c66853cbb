use crate::types::Cycle;
use serde::Serialize;
use tokio::sync::broadcast;

/// Receives every detected reset, synchronously, before `process` returns.
pub trait ResetSink: Send + Sync {
    fn on_reset(&self, provider: &str, quota_key: &str, closed_cycle: &Cycle);
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetEvent {
    pub provider: String,
    pub quota_key: String,
    pub closed_cycle: Cycle,
}

/// Writes resets to the tracing log and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogResetSink;

impl ResetSink for LogResetSink {
    fn on_reset(&self, provider: &str, quota_key: &str, closed_cycle: &Cycle) {
        tracing::info!(
            provider = %provider,
            quota = %quota_key,
            peak = closed_cycle.peak_usage,
            total_delta = closed_cycle.total_delta,
            "quota cycle closed"
        );
    }
}

/// Fans resets out to any number of async subscribers.
#[derive(Clone)]
pub struct BroadcastResetSink {
    tx: broadcast::Sender<ResetEvent>,
}

impl BroadcastResetSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResetEvent> {
        self.tx.subscribe()
    }
}

impl ResetSink for BroadcastResetSink {
    fn on_reset(&self, provider: &str, quota_key: &str, closed_cycle: &Cycle) {
        // No subscribers is fine; the event is simply dropped.
        let _ = self.tx.send(ResetEvent {
            provider: provider.to_string(),
            quota_key: quota_key.to_string(),
            closed_cycle: closed_cycle.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastResetSink::new(8);
        let mut rx = sink.subscribe();
        let mut cycle = Cycle::open("codex", "primary", Utc::now(), None, 12.0);
        cycle.close(Utc::now());
        sink.on_reset("codex", "primary", &cycle);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.provider, "codex");
        assert_eq!(event.quota_key, "primary");
        assert_eq!(event.closed_cycle.peak_usage, 12.0);
    }

    #[test]
    fn broadcast_sink_without_subscribers_does_not_panic() {
        let sink = BroadcastResetSink::new(1);
        let cycle = Cycle::open("codex", "primary", Utc::now(), None, 0.0);
        sink.on_reset("codex", "primary", &cycle);
    }
}

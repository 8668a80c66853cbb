use crate::agent::{AgentStats, PollAgent};
use crate::http::HttpSnapshotSource;
use qw_config::DaemonConfig;
use qw_quota::{QuotaStore, ResetSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Gap between agent start times so their first writes don't collide.
pub const STAGGER_STEP: Duration = Duration::from_millis(200);

/// Owns every running poll agent and their shared cancellation token.
pub struct AgentSupervisor {
    cancel: CancellationToken,
    agents: Vec<(String, JoinHandle<AgentStats>)>,
}

impl Default for AgentSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentSupervisor {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            agents: Vec::new(),
        }
    }

    /// Builds and spawns one HTTP-backed agent per enabled provider.
    pub fn start_from_config(
        config: &DaemonConfig,
        store: Arc<dyn QuotaStore>,
        sink: Arc<dyn ResetSink>,
    ) -> anyhow::Result<Self> {
        let mut supervisor = Self::new();
        for (index, provider) in config.enabled_providers().enumerate() {
            let source = Arc::new(HttpSnapshotSource::from_config(provider)?);
            let agent = PollAgent::new(
                source,
                store.clone(),
                config.tracker_config_for(provider),
                config.tracking.accountant_config(),
            )
            .with_sink(sink.clone())
            .with_start_delay(STAGGER_STEP * index as u32);
            supervisor.spawn(agent);
        }
        if supervisor.is_empty() {
            tracing::warn!("no enabled providers configured; nothing to poll");
        }
        Ok(supervisor)
    }

    pub fn spawn(&mut self, agent: PollAgent) {
        let provider = agent.provider().to_string();
        let token = self.cancel.child_token();
        tracing::info!(provider = %provider, "spawning poll agent");
        let handle = tokio::spawn(agent.run(token));
        self.agents.push((provider, handle));
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels every agent and waits for each to close its session.
    pub async fn shutdown(self) -> Vec<(String, AgentStats)> {
        self.cancel.cancel();
        let mut stats = Vec::with_capacity(self.agents.len());
        for (provider, handle) in self.agents {
            match handle.await {
                Ok(agent_stats) => stats.push((provider, agent_stats)),
                Err(e) => tracing::error!(provider = %provider, error = %e, "poll agent task failed"),
            }
        }
        stats
    }
}

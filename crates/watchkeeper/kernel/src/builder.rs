//! Builder for [`MonitorAgent`].
//!
//! Collaborators are passed in explicitly; nothing is reached through a
//! global. The audit memory defaults to the in-memory backend.

use std::sync::Arc;

use watchkeeper_storage::{AuditMemory, InMemoryAuditMemory};

use crate::agent::MonitorAgent;
use crate::broadcaster::EventBroadcaster;
use crate::config::KernelConfig;
use crate::detector::ChangeDetector;
use crate::error::AgentError;
use crate::gate::ValidationGate;
use crate::orchestrator::RunOrchestrator;
use crate::policy::SkipPolicy;
use crate::provider::{AnalysisProvider, NarrativeProvider};
use crate::source::SnapshotSource;

pub struct MonitorAgentBuilder {
    config: KernelConfig,
    memory: Option<Arc<dyn AuditMemory>>,
    source: Option<Arc<dyn SnapshotSource>>,
    analysis: Option<Arc<dyn AnalysisProvider>>,
    narrative: Option<Arc<dyn NarrativeProvider>>,
}

impl MonitorAgentBuilder {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            memory: None,
            source: None,
            analysis: None,
            narrative: None,
        }
    }

    /// Set the audit memory
    pub fn with_memory(mut self, memory: Arc<dyn AuditMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Set the polled snapshot source
    pub fn with_source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the analysis provider
    pub fn with_analysis(mut self, analysis: Arc<dyn AnalysisProvider>) -> Self {
        self.analysis = Some(analysis);
        self
    }

    /// Set the optional narrative provider
    pub fn with_narrative(mut self, narrative: Arc<dyn NarrativeProvider>) -> Self {
        self.narrative = Some(narrative);
        self
    }

    pub fn build(self) -> Result<MonitorAgent, AgentError> {
        let source = self
            .source
            .ok_or(AgentError::MissingDependency("snapshot source"))?;
        let analysis = self
            .analysis
            .ok_or(AgentError::MissingDependency("analysis provider"))?;
        let memory = self
            .memory
            .unwrap_or_else(|| Arc::new(InMemoryAuditMemory::new()));

        let config = self.config;
        let broadcaster = Arc::new(EventBroadcaster::new(config.broadcaster.clone()));
        let gate = Arc::new(ValidationGate::with_config(
            config.gate.clone(),
            memory.clone(),
            broadcaster.clone(),
        ));
        let detector = Arc::new(ChangeDetector::new(source, config.detector.clone()));

        let mut orchestrator = RunOrchestrator::new(
            config.orchestrator.clone(),
            SkipPolicy::new(config.policy.clone()),
            memory.clone(),
            gate.clone(),
            broadcaster.clone(),
            detector.clone(),
            analysis,
        );
        if let Some(narrative) = self.narrative {
            orchestrator = orchestrator.with_narrative(narrative);
        }

        Ok(MonitorAgent::new(
            config,
            memory,
            broadcaster,
            gate,
            detector,
            Arc::new(orchestrator),
        ))
    }
}

impl Default for MonitorAgentBuilder {
    fn default() -> Self {
        Self::new(KernelConfig::default())
    }
}

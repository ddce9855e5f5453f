//! Pipeline engine: dependency-ordered, sequential stage execution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error};

use crate::error::PipelineError;
use crate::pipeline::types::{PipelineContext, PipelineReport, RunStatus, Stage, StageStatus};

/// Collects stages, then orders them once in [`build`](Self::build).
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
}

impl PipelineBuilder {
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Topologically order the stages. Ties keep insertion order.
    ///
    /// Duplicate names, unknown dependencies and cycles are configuration
    /// errors.
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let mut index: HashMap<&'static str, usize> = HashMap::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if index.insert(stage.name(), i).is_some() {
                return Err(PipelineError::Config(format!(
                    "duplicate stage '{}'",
                    stage.name()
                )));
            }
        }

        let mut indegree = vec![0usize; self.stages.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.stages.len()];
        for (i, stage) in self.stages.iter().enumerate() {
            for dep in stage.dependencies() {
                let &d = index.get(dep).ok_or_else(|| {
                    PipelineError::Config(format!(
                        "stage '{}' depends on unknown stage '{dep}'",
                        stage.name()
                    ))
                })?;
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut order = Vec::with_capacity(self.stages.len());
        let mut placed = HashSet::new();
        while order.len() < self.stages.len() {
            let next = (0..self.stages.len()).find(|i| !placed.contains(i) && indegree[*i] == 0);
            let Some(i) = next else {
                let stuck: Vec<&str> = (0..self.stages.len())
                    .filter(|i| !placed.contains(i))
                    .map(|i| self.stages[i].name())
                    .collect();
                return Err(PipelineError::Config(format!(
                    "dependency cycle among stages: {}",
                    stuck.join(", ")
                )));
            };
            placed.insert(i);
            order.push(i);
            for &j in &dependents[i] {
                indegree[j] -= 1;
            }
        }

        let stages = order
            .into_iter()
            .map(|i| Arc::clone(&self.stages[i]))
            .collect();
        Ok(Pipeline { stages })
    }
}

/// An ordered list of stages, run one after another against a shared context.
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage in order, stopping at the first non-`Success` status.
    pub async fn run(&self, ctx: &mut PipelineContext) -> PipelineReport {
        let mut ran = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            let name = stage.name();
            match stage.process(ctx).await {
                Ok(StageStatus::Success) => {
                    debug!(run_id = %ctx.run_id, stage = name, "Stage succeeded");
                    ran.push((name, StageStatus::Success.label()));
                }
                Ok(status @ (StageStatus::Done(_) | StageStatus::Skip(_))) => {
                    ran.push((name, status.label()));
                    let reason = match status {
                        StageStatus::Done(r) | StageStatus::Skip(r) => r,
                        StageStatus::Success => String::new(),
                    };
                    debug!(run_id = %ctx.run_id, stage = name, reason = %reason, "Pipeline stopped");
                    return PipelineReport {
                        run_id: ctx.run_id,
                        status: RunStatus::Stopped {
                            stage: name,
                            reason,
                        },
                        stages: ran,
                    };
                }
                Err(e) => {
                    error!(
                        run_id = %ctx.run_id,
                        stage = name,
                        conversation_id = ctx.conversation.id,
                        platform = %ctx.event.platform,
                        error = %e,
                        "Stage failed"
                    );
                    ran.push((name, "error"));
                    return PipelineReport {
                        run_id: ctx.run_id,
                        status: RunStatus::Failed {
                            stage: name,
                            error: e.to_string(),
                        },
                        stages: ran,
                    };
                }
            }
        }

        PipelineReport {
            run_id: ctx.run_id,
            status: RunStatus::Completed,
            stages: ran,
        }
    }
}

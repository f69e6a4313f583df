//! Sequential pipeline execution with a whole-run time limit.

use crate::steps::{default_steps, Revision, RunContext, Step, StepOutcome};
use crate::trigger::TriggerEvent;
use chrono::{DateTime, Utc};
use hosting::{DeployReceipt, HealthReport};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The event is not one the pipeline listens to
    NotTriggered,
    Succeeded,
    Failed,
    TimedOut,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::NotTriggered => write!(f, "not triggered"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::TimedOut => write!(f, "timed out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub pipeline: String,
    pub event: TriggerEvent,
    pub status: RunStatus,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
    pub revision: Option<Revision>,
    pub archive: Option<PathBuf>,
    pub receipt: Option<DeployReceipt>,
    pub health: Option<HealthReport>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// The first failed step, if any
    pub fn failed_step(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.outcome.is_failure())
    }
}

pub struct PipelineRunner {
    steps: Vec<Box<dyn Step>>,
    timeout: Option<Duration>,
}

impl Default for PipelineRunner {
    fn default() -> Self {
        Self::new(default_steps())
    }
}

impl PipelineRunner {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self {
            steps,
            timeout: None,
        }
    }

    /// Use `timeout` instead of the definition's `timeout_minutes`.
    ///
    /// When the limit expires the step in progress is dropped. Blocking work it
    /// handed off is told to stop but may still be winding down when `run`
    /// returns.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, ctx: &mut RunContext) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let definition_name = ctx.definition.name.clone();
        let mut records = Vec::with_capacity(self.steps.len());

        let status = if !ctx.definition.triggers.matches(&ctx.event) {
            info!("{} does not trigger {}", ctx.event, definition_name);
            RunStatus::NotTriggered
        } else {
            let limit = self.timeout.unwrap_or_else(|| ctx.definition.timeout());
            info!(
                "Run {} of {} for {} (limit {:?})",
                run_id, definition_name, ctx.event, limit
            );
            self.run_steps(ctx, limit, &mut records).await
        };

        match status {
            RunStatus::Succeeded => info!("Run {} succeeded", run_id),
            RunStatus::NotTriggered => {}
            other => error!("Run {} {}", run_id, other),
        }

        RunReport {
            run_id,
            pipeline: definition_name,
            event: ctx.event.clone(),
            status,
            dry_run: ctx.dry_run,
            started_at,
            finished_at: Utc::now(),
            steps: records,
            revision: ctx.revision.clone(),
            archive: ctx.archive.as_ref().map(|a| a.path.clone()),
            receipt: ctx.receipt.clone(),
            health: ctx.health.clone(),
        }
    }

    async fn run_steps(
        &self,
        ctx: &mut RunContext,
        limit: Duration,
        records: &mut Vec<StepRecord>,
    ) -> RunStatus {
        // A limit too large to represent as an instant means no deadline
        let deadline = tokio::time::Instant::now().checked_add(limit);
        if deadline.is_none() {
            warn!("Run limit {:?} is out of range, running without a deadline", limit);
        }
        let mut status = RunStatus::Succeeded;

        for step in &self.steps {
            if status != RunStatus::Succeeded {
                records.push(StepRecord {
                    name: step.name().to_string(),
                    outcome: StepOutcome::skipped(format!("run {}", status)),
                    duration_ms: 0,
                });
                continue;
            }

            info!("Step {}", step.name());
            let start = Instant::now();
            let result = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, step.run(ctx)).await,
                None => Ok(step.run(ctx).await),
            };
            let outcome = match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    error!("Step {} failed: {}", step.name(), e);
                    status = RunStatus::Failed;
                    StepOutcome::Failed {
                        error: e.to_string(),
                    }
                }
                Err(_) => {
                    error!("Step {} exceeded the run limit of {:?}", step.name(), limit);
                    status = RunStatus::TimedOut;
                    StepOutcome::Failed {
                        error: format!("timed out after {:?}", limit),
                    }
                }
            };

            if let StepOutcome::Warned { message } = &outcome {
                warn!("Step {}: {}", step.name(), message);
            }

            records.push(StepRecord {
                name: step.name().to_string(),
                outcome,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::{SecretStore, StepError, StepResult};
    use crate::workflow::PipelineDefinition;
    use async_trait::async_trait;
    use packager::{PackagerResult, ProcessOutput, ProcessRunner, ProcessSpec};
    use std::sync::{Arc, Mutex};

    struct NoProcesses;

    #[async_trait]
    impl ProcessRunner for NoProcesses {
        async fn run(&self, _spec: &ProcessSpec) -> PackagerResult<ProcessOutput> {
            Ok(ProcessOutput::success())
        }
    }

    enum Behaviour {
        Succeed,
        Warn,
        Fail,
        Hang,
    }

    struct FakeStep {
        name: &'static str,
        behaviour: Behaviour,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Step for FakeStep {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self, _ctx: &mut RunContext) -> StepResult<StepOutcome> {
            self.log.lock().unwrap().push(self.name);
            match self.behaviour {
                Behaviour::Succeed => Ok(StepOutcome::succeeded("ok")),
                Behaviour::Warn => Ok(StepOutcome::Warned {
                    message: "meh".to_string(),
                }),
                Behaviour::Fail => Err(StepError::Precondition {
                    message: "boom".to_string(),
                }),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(StepOutcome::succeeded("late"))
                }
            }
        }
    }

    fn runner(
        steps: Vec<(&'static str, Behaviour)>,
    ) -> (PipelineRunner, Arc<Mutex<Vec<&'static str>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let steps = steps
            .into_iter()
            .map(|(name, behaviour)| {
                Box::new(FakeStep {
                    name,
                    behaviour,
                    log: log.clone(),
                }) as Box<dyn Step>
            })
            .collect();
        (PipelineRunner::new(steps), log)
    }

    fn context(event: TriggerEvent) -> RunContext {
        RunContext::new(
            ".",
            PipelineDefinition::default(),
            Arc::new(NoProcesses),
            SecretStore::new(),
        )
        .with_event(event)
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let (runner, log) = runner(vec![
            ("a", Behaviour::Succeed),
            ("b", Behaviour::Warn),
            ("c", Behaviour::Succeed),
        ]);
        let mut ctx = context(TriggerEvent::push("refs/heads/main"));

        let report = runner.run(&mut ctx).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert!(report.is_success());
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(report.steps.len(), 3);
        assert!(matches!(
            report.step("b").unwrap().outcome,
            StepOutcome::Warned { .. }
        ));
    }

    #[tokio::test]
    async fn test_first_failure_aborts_run() {
        let (runner, log) = runner(vec![
            ("a", Behaviour::Succeed),
            ("b", Behaviour::Fail),
            ("c", Behaviour::Succeed),
            ("d", Behaviour::Succeed),
        ]);
        let mut ctx = context(TriggerEvent::WorkflowDispatch);

        let report = runner.run(&mut ctx).await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(report.failed_step().unwrap().name, "b");
        assert_eq!(
            report.step("b").unwrap().outcome,
            StepOutcome::Failed {
                error: "Precondition failed: boom".to_string()
            }
        );
        for name in ["c", "d"] {
            assert!(matches!(
                report.step(name).unwrap().outcome,
                StepOutcome::Skipped { .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_timeout_fails_step_in_progress() {
        let (runner, log) = runner(vec![
            ("a", Behaviour::Succeed),
            ("slow", Behaviour::Hang),
            ("c", Behaviour::Succeed),
        ]);
        let runner = runner.with_timeout(Duration::from_millis(50));
        let mut ctx = context(TriggerEvent::WorkflowDispatch);

        let report = runner.run(&mut ctx).await;

        assert_eq!(report.status, RunStatus::TimedOut);
        assert_eq!(*log.lock().unwrap(), vec!["a", "slow"]);
        assert!(report.step("slow").unwrap().outcome.is_failure());
        assert!(matches!(
            report.step("c").unwrap().outcome,
            StepOutcome::Skipped { .. }
        ));
    }

    #[tokio::test]
    async fn test_unrepresentable_limit_runs_without_deadline() {
        let (runner, log) = runner(vec![("a", Behaviour::Succeed), ("b", Behaviour::Succeed)]);
        let runner = runner.with_timeout(Duration::MAX);
        let mut ctx = context(TriggerEvent::WorkflowDispatch);

        let report = runner.run(&mut ctx).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_untriggered_event_runs_nothing() {
        for event in [
            TriggerEvent::push("refs/heads/develop"),
            TriggerEvent::push("refs/tags/v1.0"),
            TriggerEvent::Other {
                name: "pull_request".to_string(),
            },
        ] {
            let (runner, log) = runner(vec![("a", Behaviour::Succeed)]);
            let mut ctx = context(event);

            let report = runner.run(&mut ctx).await;

            assert_eq!(report.status, RunStatus::NotTriggered);
            assert!(report.steps.is_empty());
            assert!(log.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_report_serializes() {
        let (runner, _) = runner(vec![("a", Behaviour::Succeed)]);
        let mut ctx = context(TriggerEvent::WorkflowDispatch);
        let report = runner.run(&mut ctx).await;

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["event"]["event"], "workflow_dispatch");
        assert_eq!(json["steps"][0]["name"], "a");
        assert_eq!(json["steps"][0]["outcome"], "succeeded");
        assert!(report.finished_at >= report.started_at);
    }

    #[test]
    fn test_default_runner_steps() {
        let runner = PipelineRunner::default();
        assert_eq!(runner.step_names().first(), Some(&"checkout"));
        assert_eq!(runner.step_names().last(), Some(&"health-check"));
    }
}

pub mod runner;
pub mod steps;
pub mod trigger;
pub mod workflow;

pub use runner::{PipelineRunner, RunReport, RunStatus, StepRecord};
pub use steps::{
    connect_provider, default_steps, read_revision, Revision, RunContext, SecretStore, Step,
    StepError, StepOutcome, StepResult,
};
pub use trigger::{branch_from_ref, TriggerConfig, TriggerEvent};
pub use workflow::{DefinitionError, DefinitionResult, DeploySettings, PipelineDefinition};

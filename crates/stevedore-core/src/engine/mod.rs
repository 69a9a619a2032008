//! The workflow engine: DAG scheduling, artifact plumbing, run events.

mod events;
mod graph;
mod plumbing;
mod scheduler;

pub use events::{EventKind, EventReader, EventWriter, RunEvent};
pub use graph::Graph;
pub use plumbing::{collect_outputs, stage, StagedNode};
pub use scheduler::{Engine, EngineConfig, StepExecutor, StepRun};

//! Workflow data model: container specs, graph nodes, results.

mod container;
mod node;
mod resources;
mod validate;

pub use container::{ContainerSpec, WaitStrategy, DEFAULT_STARTUP_TIMEOUT_SECONDS};
pub use node::{
    Artifact, ArtifactKind, DagNode, DagWorkflow, InputMapping, Iteration, NodeResult, NodeStatus,
    OutputDefinition, OutputSource, RunIds, RunResult, StepOutputs,
};
pub use resources::{parse_memory_bytes, parse_milli_cpus, ResourceLimits};
pub use validate::{
    is_valid_name, resolve_input_producer, transitive_dependencies, validate_workflow,
};

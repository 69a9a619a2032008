use std::collections::{HashMap, HashSet};

use regex::Regex;

use super::node::{Artifact, DagNode, DagWorkflow, OutputSource};
use crate::condition;
use crate::error::{Error, Result};
use crate::template;

/// Node and artifact identifier rule: `[A-Za-z_][A-Za-z0-9_-]*`.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn valid_key_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains('/')
}

/// Validate a whole graph before anything is executed.
///
/// Checks node names, images, dependency references, acyclicity, artifact
/// declarations, output definitions, input mappings, `when` syntax, and
/// step references. The first violation aborts submission.
pub fn validate_workflow(workflow: &DagWorkflow) -> Result<()> {
    if workflow.nodes.is_empty() {
        return Err(Error::Validation("workflow has no nodes".into()));
    }

    let mut names = HashSet::new();
    for node in &workflow.nodes {
        if !is_valid_name(&node.name) {
            return Err(Error::Validation(format!(
                "invalid node name '{}'",
                node.name
            )));
        }
        if !names.insert(node.name.as_str()) {
            return Err(Error::Validation(format!(
                "duplicate node name '{}'",
                node.name
            )));
        }
    }

    for node in &workflow.nodes {
        validate_node(node, &names)?;
    }

    check_acyclic(workflow)?;

    // Reference checks need the dependency closure, so they run after the
    // cycle check.
    for node in &workflow.nodes {
        let reachable = transitive_dependencies(workflow, &node.name);
        validate_step_references(node, &names, &reachable)?;
        for artifact in &node.input_artifacts {
            resolve_input_producer(workflow, node, artifact)?;
        }
    }

    for (idx, handler) in workflow.exit_handlers.iter().enumerate() {
        if handler.image.is_empty() {
            return Err(Error::Validation(format!(
                "exit handler {idx} has no image"
            )));
        }
        for text in handler
            .command
            .iter()
            .chain(handler.entrypoint.iter())
            .chain(handler.env.values())
        {
            for step in template::referenced_steps(text) {
                if !names.contains(step.as_str()) {
                    return Err(Error::Validation(format!(
                        "exit handler {idx} references unknown step '{step}'"
                    )));
                }
            }
        }
    }

    Ok(())
}

fn validate_node(node: &DagNode, names: &HashSet<&str>) -> Result<()> {
    let name = &node.name;

    if node.container.image.is_empty() {
        return Err(Error::Validation(format!("node '{name}' has no image")));
    }

    if let Some(resources) = &node.resources {
        resources
            .validate()
            .map_err(|e| Error::Validation(format!("node '{name}': {e}")))?;
    }

    let mut seen_deps = HashSet::new();
    for dep in &node.depends_on {
        if dep == name {
            return Err(Error::Validation(format!(
                "node '{name}' depends on itself"
            )));
        }
        if !names.contains(dep.as_str()) {
            return Err(Error::Validation(format!(
                "node '{name}' depends on unknown node '{dep}'"
            )));
        }
        if !seen_deps.insert(dep.as_str()) {
            return Err(Error::Validation(format!(
                "node '{name}' lists dependency '{dep}' twice"
            )));
        }
    }

    let mut artifact_names = HashSet::new();
    for artifact in node.input_artifacts.iter().chain(&node.output_artifacts) {
        if !valid_key_segment(&artifact.name) {
            return Err(Error::Validation(format!(
                "node '{name}': artifact name '{}' is not a valid key segment",
                artifact.name
            )));
        }
        if !artifact.path.starts_with('/') {
            return Err(Error::Validation(format!(
                "node '{name}': artifact '{}' path '{}' is not absolute",
                artifact.name, artifact.path
            )));
        }
    }
    for artifact in &node.input_artifacts {
        if !artifact_names.insert(("in", artifact.name.as_str())) {
            return Err(Error::Validation(format!(
                "node '{name}': duplicate input artifact '{}'",
                artifact.name
            )));
        }
    }
    for artifact in &node.output_artifacts {
        if !artifact_names.insert(("out", artifact.name.as_str())) {
            return Err(Error::Validation(format!(
                "node '{name}': duplicate output artifact '{}'",
                artifact.name
            )));
        }
    }

    let mut output_names = HashSet::new();
    for output in &node.outputs {
        if output.name.is_empty() {
            return Err(Error::Validation(format!(
                "node '{name}': output definition with empty name"
            )));
        }
        if !output_names.insert(output.name.as_str()) {
            return Err(Error::Validation(format!(
                "node '{name}': duplicate output '{}'",
                output.name
            )));
        }
        if output.source == OutputSource::File && output.path.is_none() {
            return Err(Error::Validation(format!(
                "node '{name}': file output '{}' has no path",
                output.name
            )));
        }
        if let Some(pattern) = &output.regex {
            Regex::new(pattern).map_err(|e| {
                Error::Validation(format!(
                    "node '{name}': output '{}' regex does not compile: {e}",
                    output.name
                ))
            })?;
        }
    }

    let mut mapped_envs = HashSet::new();
    for mapping in &node.input_mappings {
        if mapping.env.is_empty() {
            return Err(Error::Validation(format!(
                "node '{name}': input mapping with empty env name"
            )));
        }
        if !mapped_envs.insert(mapping.env.as_str()) {
            return Err(Error::Validation(format!(
                "node '{name}': duplicate input mapping for env '{}'",
                mapping.env
            )));
        }
        if mapping.parse_source().is_none() {
            return Err(Error::Validation(format!(
                "node '{name}': input mapping source '{}' is not 'step.output'",
                mapping.source
            )));
        }
    }

    if let Some(when) = &node.when {
        // Syntax only here; evaluation happens once dependencies terminate.
        condition::parse(when)?;
    }

    Ok(())
}

/// Names of every node the given node (transitively) depends on.
pub fn transitive_dependencies(workflow: &DagWorkflow, name: &str) -> HashSet<String> {
    let by_name: HashMap<&str, &DagNode> =
        workflow.nodes.iter().map(|n| (n.name.as_str(), n)).collect();

    let mut reachable = HashSet::new();
    let mut stack: Vec<&str> = by_name
        .get(name)
        .map(|n| n.depends_on.iter().map(String::as_str).collect())
        .unwrap_or_default();

    while let Some(current) = stack.pop() {
        if !reachable.insert(current.to_string()) {
            continue;
        }
        if let Some(node) = by_name.get(current) {
            stack.extend(node.depends_on.iter().map(String::as_str));
        }
    }

    reachable
}

fn validate_step_references(
    node: &DagNode,
    names: &HashSet<&str>,
    reachable: &HashSet<String>,
) -> Result<()> {
    let name = &node.name;

    let check = |step: &str| -> Result<()> {
        if !names.contains(step) {
            return Err(Error::Validation(format!(
                "node '{name}' references unknown step '{step}'"
            )));
        }
        if !reachable.contains(step) {
            return Err(Error::Validation(format!(
                "node '{name}' references step '{step}' which is not among its dependencies"
            )));
        }
        Ok(())
    };

    for text in node
        .container
        .command
        .iter()
        .chain(node.container.entrypoint.iter())
        .chain(node.container.env.values())
    {
        for step in template::referenced_steps(text) {
            check(&step)?;
        }
    }

    for mapping in &node.input_mappings {
        if let Some((step, _)) = mapping.parse_source() {
            check(step)?;
        }
    }

    if let Some(when) = &node.when {
        for step in condition::parse(when)?.referenced_steps() {
            check(&step)?;
        }
    }

    Ok(())
}

/// Find the step that produces an input artifact.
///
/// An explicit `source_step` must be a transitive dependency declaring an
/// output artifact of the same name. Otherwise the unique such dependency is
/// used; zero producers is an error for required inputs, ambiguity always is.
pub fn resolve_input_producer(
    workflow: &DagWorkflow,
    node: &DagNode,
    artifact: &Artifact,
) -> Result<Option<String>> {
    let reachable = transitive_dependencies(workflow, &node.name);

    if let Some(source) = &artifact.source_step {
        if !reachable.contains(source) {
            return Err(Error::Validation(format!(
                "node '{}': input artifact '{}' names source step '{source}' which is not a dependency",
                node.name, artifact.name
            )));
        }
        let declares = workflow
            .node(source)
            .is_some_and(|n| n.output_artifacts.iter().any(|a| a.name == artifact.name));
        if !declares {
            return Err(Error::Validation(format!(
                "node '{}': step '{source}' declares no output artifact '{}'",
                node.name, artifact.name
            )));
        }
        return Ok(Some(source.clone()));
    }

    let mut producers = workflow.nodes.iter().filter(|n| {
        reachable.contains(&n.name)
            && n.output_artifacts.iter().any(|a| a.name == artifact.name)
    });

    match (producers.next(), producers.next()) {
        (Some(producer), None) => Ok(Some(producer.name.clone())),
        (Some(a), Some(b)) => Err(Error::Validation(format!(
            "node '{}': input artifact '{}' is produced by both '{}' and '{}'; set source_step",
            node.name, artifact.name, a.name, b.name
        ))),
        (None, _) => {
            if artifact.optional {
                Ok(None)
            } else {
                Err(Error::Validation(format!(
                    "node '{}': no dependency produces required input artifact '{}'",
                    node.name, artifact.name
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Depth-first search with gray/black marks; the first back edge found is
/// named in the error.
fn check_acyclic(workflow: &DagWorkflow) -> Result<()> {
    let by_name: HashMap<&str, &DagNode> =
        workflow.nodes.iter().map(|n| (n.name.as_str(), n)).collect();

    let mut marks: HashMap<&str, Mark> = workflow
        .nodes
        .iter()
        .map(|n| (n.name.as_str(), Mark::White))
        .collect();

    for node in &workflow.nodes {
        if marks.get(node.name.as_str()) == Some(&Mark::White) {
            visit(node.name.as_str(), &by_name, &mut marks)?;
        }
    }

    Ok(())
}

fn visit<'a>(
    name: &'a str,
    by_name: &HashMap<&'a str, &'a DagNode>,
    marks: &mut HashMap<&'a str, Mark>,
) -> Result<()> {
    marks.insert(name, Mark::Gray);

    if let Some(node) = by_name.get(name) {
        for dep in &node.depends_on {
            match marks.get(dep.as_str()) {
                Some(Mark::Gray) => {
                    return Err(Error::Validation(format!(
                        "dependency cycle detected: '{name}' -> '{dep}' closes a loop"
                    )));
                }
                Some(Mark::White) => visit(dep.as_str(), by_name, marks)?,
                _ => {}
            }
        }
    }

    marks.insert(name, Mark::Black);
    Ok(())
}

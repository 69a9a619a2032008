//! Output extraction: turn a terminated step's streams and files into the
//! named values published to dependents.

use std::collections::HashMap;
use std::path::PathBuf;

use regex::Regex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{OutputDefinition, OutputSource};

/// Extract every declared output.
///
/// `resolve_file` maps an in-container path to the host path the step's
/// staging mounts exposed it at; `file`-sourced outputs read through it.
/// A definition that produces no value falls back to its default; required
/// definitions without a value fail the step.
pub fn extract_outputs(
    definitions: &[OutputDefinition],
    stdout: &str,
    stderr: &str,
    resolve_file: impl Fn(&str) -> Option<PathBuf>,
) -> Result<HashMap<String, String>> {
    let mut outputs = HashMap::new();

    for definition in definitions {
        let text = match definition.source {
            OutputSource::Stdout => Some(stdout.to_string()),
            OutputSource::Stderr => Some(stderr.to_string()),
            OutputSource::File => read_file_source(definition, &resolve_file)?,
        };

        let value = match text {
            Some(text) => apply_regex(definition, &text)?,
            None => None,
        };

        match value.or_else(|| definition.default.clone()) {
            Some(value) => {
                outputs.insert(definition.name.clone(), value);
            }
            None if definition.required => {
                return Err(Error::Artifact(format!(
                    "required output '{}' produced no value",
                    definition.name
                )));
            }
            None => {
                debug!(output = %definition.name, "optional output produced no value");
            }
        }
    }

    Ok(outputs)
}

fn read_file_source(
    definition: &OutputDefinition,
    resolve_file: &impl Fn(&str) -> Option<PathBuf>,
) -> Result<Option<String>> {
    let path = definition.path.as_deref().ok_or_else(|| {
        Error::Internal(format!(
            "file output '{}' has no path past validation",
            definition.name
        ))
    })?;

    let Some(host_path) = resolve_file(path) else {
        debug!(output = %definition.name, path, "file output path is not staged");
        return Ok(None);
    };

    match std::fs::read_to_string(&host_path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Artifact(format!(
            "reading output file '{}': {e}",
            host_path.display()
        ))),
    }
}

/// Apply the definition's regex; capture group 1 wins, the whole match when
/// the regex has no group, the trimmed text when there is no regex.
fn apply_regex(definition: &OutputDefinition, text: &str) -> Result<Option<String>> {
    let Some(pattern) = &definition.regex else {
        let trimmed = text.trim();
        return Ok((!trimmed.is_empty()).then(|| trimmed.to_string()));
    };

    let re = Regex::new(pattern).map_err(|e| {
        Error::Internal(format!(
            "output '{}' regex rejected past validation: {e}",
            definition.name
        ))
    })?;

    Ok(re.captures(text).map(|caps| {
        caps.get(1)
            .or_else(|| caps.get(0))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    }))
}

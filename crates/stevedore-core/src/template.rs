//! Token substitution over container specs.
//!
//! Three token families are recognised, always wrapped in `{{ }}`:
//! workflow parameters (`{{.name}}`), loop bindings (`{{item}}`,
//! `{{index}}`), and step outputs (`{{steps.node.output}}`,
//! `{{steps.node.exitCode}}`). Substitution is plain string replacement;
//! unknown tokens are left intact and logged.

use std::collections::HashMap;

use regex::Regex;
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::{ContainerSpec, Iteration, StepOutputs};

/// `{{` ws? body ws? `}}`.
const TOKEN_PATTERN: &str = r"\{\{\s*([^{}]+?)\s*\}\}";

/// Parsed form of one template token body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// `.name` — workflow parameter.
    Param(String),
    /// `item` — current loop item.
    Item,
    /// `index` — current 0-based loop index.
    Index,
    /// `steps.node.output` — a published step output.
    StepOutput { node: String, output: String },
    /// `steps.node.exitCode`.
    StepExitCode { node: String },
}

fn is_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Parse a token body (the text between the braces, already trimmed).
///
/// Returns `None` for anything that is not one of the recognised families;
/// such tokens pass through untouched.
pub fn parse_token(body: &str) -> Option<Token> {
    if let Some(name) = body.strip_prefix('.') {
        return is_name(name).then(|| Token::Param(name.to_string()));
    }
    if body == "item" {
        return Some(Token::Item);
    }
    if body == "index" {
        return Some(Token::Index);
    }
    if let Some(rest) = body.strip_prefix("steps.") {
        let (node, field) = rest.split_once('.')?;
        if !is_name(node) {
            return None;
        }
        if field == "exitCode" {
            return Some(Token::StepExitCode {
                node: node.to_string(),
            });
        }
        return is_name(field).then(|| Token::StepOutput {
            node: node.to_string(),
            output: field.to_string(),
        });
    }
    None
}

/// Collect the step names referenced by `steps.*` tokens in a string.
pub fn referenced_steps(text: &str) -> Vec<String> {
    let re = token_regex();
    let mut steps = Vec::new();
    for caps in re.captures_iter(text) {
        match parse_token(&caps[1]) {
            Some(Token::StepOutput { node, .. }) | Some(Token::StepExitCode { node }) => {
                if !steps.contains(&node) {
                    steps.push(node);
                }
            }
            _ => {}
        }
    }
    steps
}

fn token_regex() -> Regex {
    Regex::new(TOKEN_PATTERN).expect("token pattern is a valid regex")
}

/// Everything a render pass can draw values from.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    /// Workflow parameters.
    pub params: &'a HashMap<String, String>,
    /// Per-node parameter overrides; consulted before `params`.
    pub node_params: Option<&'a HashMap<String, String>>,
    pub iteration: Option<&'a Iteration>,
    pub outputs: &'a StepOutputs,
}

impl<'a> TemplateContext<'a> {
    fn lookup_param(&self, name: &str) -> Option<&'a str> {
        if let Some(overrides) = self.node_params {
            if let Some(v) = overrides.get(name) {
                return Some(v.as_str());
            }
        }
        self.params.get(name).map(String::as_str)
    }
}

/// Substitute every recognised token in `text`.
///
/// Unknown tokens (unparseable bodies, unset parameters, outputs a
/// terminated step never published) are left intact with a warning. A
/// `steps.` reference to a node that has not terminated is a hard
/// [`Error::Template`].
pub fn render_str(text: &str, ctx: &TemplateContext<'_>) -> Result<String> {
    let re = token_regex();
    let mut rendered = String::with_capacity(text.len());
    let mut last = 0;

    for caps in re.captures_iter(text) {
        let whole = caps.get(0).ok_or_else(|| Error::Internal("empty capture".into()))?;
        rendered.push_str(&text[last..whole.start()]);
        last = whole.end();

        let body = &caps[1];
        match parse_token(body) {
            Some(Token::Param(name)) => match ctx.lookup_param(&name) {
                Some(value) => rendered.push_str(value),
                None => {
                    warn!(token = whole.as_str(), "unknown parameter, leaving token intact");
                    rendered.push_str(whole.as_str());
                }
            },
            Some(Token::Item) => match ctx.iteration.and_then(|i| i.item.as_deref()) {
                Some(item) => rendered.push_str(item),
                None => {
                    warn!(token = whole.as_str(), "no loop item in scope, leaving token intact");
                    rendered.push_str(whole.as_str());
                }
            },
            Some(Token::Index) => match ctx.iteration {
                Some(iter) => rendered.push_str(&iter.index.to_string()),
                None => {
                    warn!(token = whole.as_str(), "no loop index in scope, leaving token intact");
                    rendered.push_str(whole.as_str());
                }
            },
            Some(Token::StepOutput { node, output }) => {
                if !ctx.outputs.has_terminated(&node) && !ctx.outputs.is_skipped(&node) {
                    return Err(Error::Template(format!(
                        "step '{node}' has not run; cannot resolve '{}'",
                        whole.as_str()
                    )));
                }
                match ctx.outputs.output(&node, &output) {
                    Some(value) => rendered.push_str(value),
                    None => {
                        warn!(
                            token = whole.as_str(),
                            node = %node,
                            "step published no such output, leaving token intact"
                        );
                        rendered.push_str(whole.as_str());
                    }
                }
            }
            Some(Token::StepExitCode { node }) => match ctx.outputs.exit_code(&node) {
                Some(code) => rendered.push_str(&code.to_string()),
                None => {
                    if ctx.outputs.is_skipped(&node) {
                        warn!(node = %node, "skipped step has no exit code, leaving token intact");
                        rendered.push_str(whole.as_str());
                    } else {
                        return Err(Error::Template(format!(
                            "step '{node}' has not run; cannot resolve '{}'",
                            whole.as_str()
                        )));
                    }
                }
            },
            None => {
                warn!(token = whole.as_str(), "unrecognised token, leaving intact");
                rendered.push_str(whole.as_str());
            }
        }
    }

    rendered.push_str(&text[last..]);
    Ok(rendered)
}

/// Render a container spec's command, entrypoint, and env values.
pub fn render_spec(spec: &ContainerSpec, ctx: &TemplateContext<'_>) -> Result<ContainerSpec> {
    let mut rendered = spec.clone();

    for arg in rendered.command.iter_mut() {
        *arg = render_str(arg, ctx)?;
    }
    for arg in rendered.entrypoint.iter_mut() {
        *arg = render_str(arg, ctx)?;
    }
    for value in rendered.env.values_mut() {
        *value = render_str(value, ctx)?;
    }

    Ok(rendered)
}

//! `$(ref.section.path...)` reference tokens.
//!
//! [`Reference::parse`] is the only place the token grammar lives. Graph
//! construction uses it through [`find_refs`] to derive dependency edges, and
//! the engine uses it through [`interpolate`] to substitute recorded values at
//! run time.

use crate::error::InterpolationError;
use crate::types::{Value, ValueMap, WorkflowExecution};
use std::collections::BTreeSet;

/// Which side of a step's recorded state a token reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Inputs,
    Outputs,
}

/// A parsed reference token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference<'a> {
    pub token: &'a str,
    pub step_ref: &'a str,
    pub section: &'a str,
    pub path: Vec<&'a str>,
}

impl<'a> Reference<'a> {
    /// Parse a leaf string.
    ///
    /// Returns `Ok(None)` for strings that are not a whole-string token.
    pub fn parse(s: &'a str) -> Result<Option<Self>, InterpolationError> {
        let Some(token) = s.strip_prefix("$(").and_then(|rest| rest.strip_suffix(')')) else {
            return Ok(None);
        };
        if token.is_empty() || token.chars().any(char::is_whitespace) {
            return Ok(None);
        }

        let mut parts = token.split('.');
        let step_ref = parts.next().unwrap_or_default();
        let Some(section) = parts.next() else {
            return Err(InterpolationError::TooFewParts(token.to_string()));
        };

        Ok(Some(Self {
            token,
            step_ref,
            section,
            path: parts.collect(),
        }))
    }

    fn section(&self) -> Result<Section, InterpolationError> {
        match self.section {
            "inputs" => Ok(Section::Inputs),
            "outputs" => Ok(Section::Outputs),
            other => Err(InterpolationError::InvalidSection {
                token: self.token.to_string(),
                part: other.to_string(),
            }),
        }
    }

    /// Resolve the token against the recorded state of an execution
    pub fn resolve(&self, state: &WorkflowExecution) -> Result<Value, InterpolationError> {
        let step = state
            .step(self.step_ref)
            .ok_or_else(|| InterpolationError::RefNotFound(self.step_ref.to_string()))?;

        let mut current = match self.section()? {
            Section::Inputs => step
                .inputs
                .as_ref()
                .map(|inputs| Value::Object(inputs.clone()))
                .unwrap_or(Value::Null),
            Section::Outputs => {
                if step.outputs.err.is_some() {
                    return Err(InterpolationError::StepErrored(self.token.to_string()));
                }
                step.outputs.value.clone().unwrap_or(Value::Null)
            }
        };

        for part in &self.path {
            current = match current {
                Value::Object(mut map) => {
                    map.remove(*part).ok_or_else(|| InterpolationError::KeyNotFound {
                        token: self.token.to_string(),
                        key: part.to_string(),
                    })?
                }
                Value::Array(mut items) => {
                    let index: usize = part.parse().map_err(|_| InterpolationError::NotAnInt {
                        token: self.token.to_string(),
                        part: part.to_string(),
                    })?;
                    if index >= items.len() {
                        return Err(InterpolationError::IndexOutOfBounds {
                            token: self.token.to_string(),
                            part: part.to_string(),
                            index,
                        });
                    }
                    items.swap_remove(index)
                }
                _ => {
                    return Err(InterpolationError::NotIndexable {
                        token: self.token.to_string(),
                        part: part.to_string(),
                    })
                }
            };
        }

        Ok(current)
    }
}

/// Collect the step refs referenced anywhere inside `inputs`
pub fn find_refs(inputs: &ValueMap) -> Result<BTreeSet<String>, InterpolationError> {
    let mut refs = BTreeSet::new();
    for value in inputs.values() {
        collect_refs(value, &mut refs)?;
    }
    Ok(refs)
}

fn collect_refs(value: &Value, refs: &mut BTreeSet<String>) -> Result<(), InterpolationError> {
    match value {
        Value::String(s) => {
            if let Some(reference) = Reference::parse(s)? {
                refs.insert(reference.step_ref.to_string());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_refs(item, refs)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_refs(item, refs)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Replace every token in `inputs` with the value it references in `state`
pub fn interpolate(
    inputs: &ValueMap,
    state: &WorkflowExecution,
) -> Result<ValueMap, InterpolationError> {
    inputs
        .iter()
        .map(|(key, value)| Ok((key.clone(), interpolate_value(value, state)?)))
        .collect()
}

fn interpolate_value(value: &Value, state: &WorkflowExecution) -> Result<Value, InterpolationError> {
    match value {
        Value::String(s) => match Reference::parse(s)? {
            Some(reference) => reference.resolve(state),
            None => Ok(value.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| interpolate_value(item, state))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => interpolate(map, state).map(Value::Object),
        _ => Ok(value.clone()),
    }
}

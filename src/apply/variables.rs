//! Variable store and templating context
//!
//! Variables come from ordered layers (target facts, global defaults, role
//! defaults, inventory host vars, run-time overrides). [`VariableStore::resolve`]
//! merges them with last-writer-wins per key; [`VariableContext`] then renders
//! string values that reference other variables and serves task rendering and
//! `when` guards.

use crate::apply::templating;
use crate::apply::TaskAction;
use crate::error::{ProvisionError, Result};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::Value;
use std::path::Path;

/// Passes allowed for variables that reference other variables
const MAX_RENDER_PASSES: usize = 8;

static VARIABLE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("variable name pattern is valid")
});

static DEFINED_TEST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\s+is\s+(?:not\s+)?(?:defined|undefined)\b")
        .expect("defined test pattern is valid")
});

/// Variables keyed by name, in first-definition order
pub type Vars = IndexMap<String, Value>;

/// One named source of variables
#[derive(Debug, Clone, Default)]
pub struct VarLayer {
    pub source: String,
    pub vars: Vars,
}

impl VarLayer {
    pub fn new(source: impl Into<String>, vars: Vars) -> Self {
        Self {
            source: source.into(),
            vars,
        }
    }
}

/// Layered variable resolution
pub struct VariableStore;

impl VariableStore {
    /// Merge layers in order; later layers override earlier keys.
    ///
    /// Pure and deterministic for a fixed layer order. A key keeps the position
    /// of its first definition.
    pub fn resolve(layers: &[VarLayer]) -> Vars {
        let mut merged = Vars::new();
        for layer in layers {
            for (key, value) in &layer.vars {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

/// Variable storage for task execution context
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    variables: Vars,
}

impl VariableContext {
    /// Create a new empty variable context
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge layers and render values that reference other variables
    pub fn from_layers(layers: &[VarLayer]) -> Result<Self> {
        let mut ctx = Self {
            variables: VariableStore::resolve(layers),
        };
        ctx.render_references()?;
        Ok(ctx)
    }

    /// Set a variable value
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    /// Get a variable value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// Check if a variable exists
    pub fn contains(&self, key: &str) -> bool {
        self.variables.contains_key(key)
    }

    pub fn vars(&self) -> &Vars {
        &self.variables
    }

    /// Context value for minijinja
    pub fn jinja_context(&self) -> minijinja::Value {
        minijinja::Value::from_serialize(&self.variables)
    }

    /// Context value with extra task-local variables layered on top
    pub fn jinja_context_with(&self, extra: &Vars) -> minijinja::Value {
        if extra.is_empty() {
            return self.jinja_context();
        }
        let mut merged = self.variables.clone();
        for (key, value) in extra {
            merged.insert(key.clone(), value.clone());
        }
        minijinja::Value::from_serialize(&merged)
    }

    /// Render a template string with variable substitution
    pub fn render_template(&self, template: &str) -> Result<String> {
        if !templating::has_template_syntax(template) {
            return Ok(template.to_string());
        }
        Ok(templating::render_with_context(
            template,
            self.jinja_context(),
        )?)
    }

    /// Evaluate a `when` guard
    pub fn evaluate_condition(&self, condition: &str) -> Result<bool> {
        Ok(templating::evaluate_expression(
            guard_expression(condition),
            self.jinja_context(),
        )?)
    }

    /// Names a `when` guard reads that no layer defines.
    ///
    /// Undefined names are falsy in guards, so a misspelt name silently skips
    /// its task. Names checked with `is defined` / `is not defined` are
    /// expected to be missing and are not reported.
    pub fn undefined_guard_names(&self, condition: &str) -> Result<Vec<String>> {
        let expression = guard_expression(condition);
        let tested: Vec<&str> = DEFINED_TEST
            .captures_iter(expression)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        let mut names: Vec<String> = templating::expression_variables(expression)?
            .into_iter()
            .filter(|name| !self.contains(name) && !tested.contains(&name.as_str()))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Render every string inside a value
    pub fn render_value(&self, value: Value) -> Result<Value> {
        Ok(match value {
            Value::String(s) => Value::String(self.render_template(&s)?),
            Value::Sequence(seq) => Value::Sequence(
                seq.into_iter()
                    .map(|v| self.render_value(v))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Mapping(map) => {
                let mut rendered = serde_yaml::Mapping::new();
                for (k, v) in map {
                    rendered.insert(k, self.render_value(v)?);
                }
                Value::Mapping(rendered)
            }
            other => other,
        })
    }

    /// Render the string fields of a task action.
    ///
    /// Inline template bodies are left alone; they are rendered at plan time
    /// together with the task's own `vars`.
    pub fn render_action(&self, action: &TaskAction) -> Result<TaskAction> {
        let mut value = serde_yaml::to_value(action)?;
        let body = match (action, &mut value) {
            (TaskAction::Template(_), Value::Mapping(map)) => map.remove("content"),
            _ => None,
        };
        let mut rendered = self.render_value(value)?;
        if let (Some(body), Value::Mapping(map)) = (body, &mut rendered) {
            map.insert(Value::String("content".to_string()), body);
        }
        Ok(serde_yaml::from_value(rendered)?)
    }

    /// Render variables whose values reference other variables, until stable
    fn render_references(&mut self) -> Result<()> {
        for _ in 0..MAX_RENDER_PASSES {
            let mut changed = false;
            let keys: Vec<String> = self.variables.keys().cloned().collect();
            for key in keys {
                let current = self.variables[&key].clone();
                if !contains_template(&current) {
                    continue;
                }
                let rendered = self.render_value(current.clone()).map_err(|e| {
                    ProvisionError::Config(format!("variable '{}': {}", key, e))
                })?;
                if rendered != current {
                    self.variables.insert(key, rendered);
                    changed = true;
                }
            }
            if !changed {
                // A cycle settles on a value that still renders to itself
                if let Some((key, _)) = self.variables.iter().find(|(_, v)| contains_template(v)) {
                    return Err(ProvisionError::Config(format!(
                        "variable '{}' references itself through a cycle",
                        key
                    )));
                }
                return Ok(());
            }
        }
        Err(ProvisionError::Config(format!(
            "variables still reference templates after {} passes; check for cycles",
            MAX_RENDER_PASSES
        )))
    }
}

/// Guards may be written with or without braces
fn guard_expression(condition: &str) -> &str {
    let trimmed = condition.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .unwrap_or(trimmed)
}

fn contains_template(value: &Value) -> bool {
    match value {
        Value::String(s) => templating::has_template_syntax(s),
        Value::Sequence(seq) => seq.iter().any(contains_template),
        Value::Mapping(map) => map.values().any(contains_template),
        _ => false,
    }
}

/// Parse `-e` arguments: `KEY=VALUE` pairs or `@file` with a YAML mapping.
///
/// Values are read as YAML scalars, so `fail2ban_maxretry=3` is a number.
pub fn parse_extra_vars(args: &[String]) -> Result<Vars> {
    let mut vars = Vars::new();
    for arg in args {
        if let Some(path) = arg.strip_prefix('@') {
            for (key, value) in load_vars_file(Path::new(path))? {
                vars.insert(key, value);
            }
            continue;
        }

        let (key, raw) = arg.split_once('=').ok_or_else(|| {
            ProvisionError::Config(format!("extra var '{}' must be KEY=VALUE or @FILE", arg))
        })?;
        let key = key.trim();
        if !VARIABLE_NAME.is_match(key) {
            return Err(ProvisionError::Config(format!(
                "invalid variable name '{}'",
                key
            )));
        }
        let value = if raw.is_empty() {
            Value::String(String::new())
        } else {
            serde_yaml::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
        };
        vars.insert(key.to_string(), value);
    }
    Ok(vars)
}

/// Load a YAML mapping of variables from a file
pub fn load_vars_file(path: &Path) -> Result<Vars> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ProvisionError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    if content.trim().is_empty() {
        return Ok(Vars::new());
    }
    Ok(serde_yaml::from_str(&content)?)
}

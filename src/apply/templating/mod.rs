//! Shared templating utilities for minijinja setup and rendering

pub mod filters;
pub mod functions;

use minijinja::{Environment, UndefinedBehavior};
use std::collections::HashSet;

/// Set up minijinja environment with custom filters and functions
pub fn setup_minijinja_env(env: &mut Environment) {
    filters::add_filters(env);
    functions::add_functions(env);
}

/// Environment used for rendering task fields and templates.
///
/// Undefined variables are errors: a typo in a role must not silently render
/// an empty port or path onto the target.
pub fn strict_environment<'source>() -> Environment<'source> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    setup_minijinja_env(&mut env);
    env
}

/// Render a template with the given context using minijinja
pub fn render_with_context(
    template: &str,
    context: minijinja::Value,
) -> Result<String, minijinja::Error> {
    strict_environment().render_str(template, context)
}

/// Evaluate a boolean guard expression such as `verify_url is defined`.
///
/// Undefined variables are falsy here, so guards can test for them.
pub fn evaluate_expression(
    expression: &str,
    context: minijinja::Value,
) -> Result<bool, minijinja::Error> {
    let mut env = Environment::new();
    setup_minijinja_env(&mut env);
    let expr = env.compile_expression(expression)?;
    Ok(expr.eval(context)?.is_true())
}

/// Top-level variable names an expression reads
pub fn expression_variables(expression: &str) -> Result<HashSet<String>, minijinja::Error> {
    let env = Environment::new();
    let expr = env.compile_expression(expression)?;
    Ok(expr.undeclared_variables(false))
}

/// Whether a string contains template syntax worth rendering
pub fn has_template_syntax(value: &str) -> bool {
    value.contains("{{") || value.contains("{%")
}

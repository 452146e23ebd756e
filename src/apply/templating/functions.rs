//! Custom Jinja2 functions for templating

use minijinja::{Environment, Value as JinjaValue};

/// Add all custom functions to the minijinja environment
pub fn add_functions(env: &mut Environment) {
    env.add_function(
        "lookup",
        |type_str: String, key: Option<String>| -> JinjaValue {
            if type_str == "env" {
                if let Some(key) = key {
                    JinjaValue::from(std::env::var(key).unwrap_or_default())
                } else {
                    JinjaValue::from(String::new())
                }
            } else {
                JinjaValue::from(String::new())
            }
        },
    );
}

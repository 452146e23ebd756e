//! Custom Jinja2 filters and tests for templating

use minijinja::{Environment, Value as JinjaValue};
use std::path::Path;

/// Add all custom filters and tests to the minijinja environment
pub fn add_filters(env: &mut Environment) {
    env.add_filter("basename", |value: JinjaValue| {
        let path_str = value.as_str().unwrap_or("");
        if path_str.ends_with('/') && path_str != "/" {
            // For paths ending with / (except root), basename is empty
            String::new()
        } else {
            Path::new(path_str)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("")
                .to_string()
        }
    });

    env.add_filter("dirname", |value: JinjaValue| {
        let path_str = value.as_str().unwrap_or("");
        if path_str.is_empty() {
            return String::new();
        }
        if path_str.ends_with('/') {
            return path_str.trim_end_matches('/').to_string();
        }
        Path::new(path_str)
            .parent()
            .and_then(|p| p.to_str())
            .unwrap_or("")
            .to_string()
    });

    // Shell-quote a value for use inside command strings
    env.add_filter(
        "quote",
        |value: JinjaValue| -> Result<String, minijinja::Error> {
            let text = value.to_string();
            shlex::try_quote(&text)
                .map(|q| q.into_owned())
                .map_err(|e| {
                    minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e.to_string())
                })
        },
    );

    // `x is ip`: an IPv4 or IPv6 literal, not a hostname
    env.add_test("ip", |value: String| value.parse::<std::net::IpAddr>().is_ok());

    // Escape a literal for use inside a `regexp:` field
    env.add_filter("regex_escape", |value: JinjaValue| {
        regex::escape(&value.to_string())
    });
}

//! `{{ config.* }}` reference resolution against the daemon configuration.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn config_ref_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s?config\.([\w.-]+)\s?\}\}").expect("config ref regex"))
}

/// Renders a replacement value to the string that will be written, with
/// every `{{ config.a.b }}` reference swapped for the daemon configuration
/// value at that path. Path segments are converted from dromedary/kebab
/// case to snake_case before lookup (the configuration file uses
/// snake_case keys). An unknown reference is left intact so the problem is
/// visible in the rewritten file.
#[must_use]
pub fn resolve_config_references(replace_with: &Value, config: &Value) -> String {
    let raw = match replace_with {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    if !config_ref_regex().is_match(&raw) {
        return raw;
    }

    config_ref_regex()
        .replace_all(&raw, |caps: &regex::Captures<'_>| {
            let path = &caps[1];
            match lookup(config, path) {
                Some(found) => found,
                None => {
                    tracing::debug!(path, "configuration reference does not exist");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

fn lookup(config: &Value, path: &str) -> Option<String> {
    let mut current = config;
    for segment in path.split('.') {
        current = current.get(to_snake_case(segment))?;
    }
    Some(match current {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Converts `dromedaryCase` and `kebab-case` to `snake_case`.
#[must_use]
pub fn to_snake_case(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len() + 4);
    for (i, ch) in segment.chars().enumerate() {
        if ch == '-' || ch == ' ' {
            out.push('_');
        } else if ch.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> Value {
        json!({
            "docker": { "interface": "172.18.0.1" },
            "system": { "data_directory": "/var/lib/roost/volumes" },
            "api": { "port": 8080 }
        })
    }

    #[test]
    fn resolves_nested_reference() {
        let value = json!("{{config.docker.interface}}");
        assert_eq!(resolve_config_references(&value, &config()), "172.18.0.1");
    }

    #[test]
    fn converts_segment_casing() {
        assert_eq!(to_snake_case("dataDirectory"), "data_directory");
        assert_eq!(to_snake_case("data-directory"), "data_directory");
        assert_eq!(to_snake_case("interface"), "interface");

        let value = json!("{{config.system.dataDirectory}}");
        assert_eq!(
            resolve_config_references(&value, &config()),
            "/var/lib/roost/volumes"
        );
    }

    #[test]
    fn renders_non_string_lookups() {
        let value = json!("{{config.api.port}}");
        assert_eq!(resolve_config_references(&value, &config()), "8080");
    }

    #[test]
    fn unknown_reference_is_left_intact() {
        let value = json!("{{config.does.not.exist}}");
        assert_eq!(
            resolve_config_references(&value, &config()),
            "{{config.does.not.exist}}"
        );
    }

    #[test]
    fn plain_values_pass_through() {
        assert_eq!(resolve_config_references(&json!("25565"), &config()), "25565");
        assert_eq!(resolve_config_references(&json!(true), &config()), "true");
        assert_eq!(resolve_config_references(&json!(128), &config()), "128");
    }

    #[test]
    fn embedded_reference_keeps_surrounding_text() {
        let value = json!("host={{config.docker.interface}}:25565");
        assert_eq!(
            resolve_config_references(&value, &config()),
            "host=172.18.0.1:25565"
        );
    }
}

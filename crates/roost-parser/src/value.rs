//! Structured (JSON/YAML) rewriting over dot-notation paths.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::lookup::resolve_config_references;
use crate::{ParserError, Replacement, Result};

pub(crate) fn rewrite_json(
    contents: &[u8],
    replacements: &[Replacement],
    config: &Value,
) -> Result<Vec<u8>> {
    let mut root: Value = if contents.iter().all(u8::is_ascii_whitespace) {
        Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_slice(contents).map_err(|e| ParserError::invalid("json", e))?
    };

    apply_all(&mut root, replacements, config);

    let mut out = serde_json::to_vec_pretty(&root)
        .map_err(|e| ParserError::invalid("json", e))?;
    out.push(b'\n');
    Ok(out)
}

pub(crate) fn rewrite_yaml(
    contents: &[u8],
    replacements: &[Replacement],
    config: &Value,
) -> Result<Vec<u8>> {
    let mut root: Value = if contents.iter().all(u8::is_ascii_whitespace) {
        Value::Object(serde_json::Map::new())
    } else {
        serde_yaml::from_slice(contents).map_err(|e| ParserError::invalid("yaml", e))?
    };

    apply_all(&mut root, replacements, config);

    serde_yaml::to_string(&root)
        .map(String::into_bytes)
        .map_err(|e| ParserError::invalid("yaml", e))
}

/// Applies every replacement, fanning a single `.*` wildcard segment out
/// over the children of its base path.
pub(crate) fn apply_all(root: &mut Value, replacements: &[Replacement], config: &Value) {
    for replacement in replacements {
        let rendered = resolve_config_references(&replacement.replace_with, config);

        if let Some((base, rest)) = replacement.matches.split_once(".*") {
            let base = base.trim_matches('.');
            let rest = rest.trim_matches('.');

            let children: Vec<String> = match get_path(root, base) {
                Some(Value::Object(map)) => map.keys().cloned().collect(),
                Some(Value::Array(items)) => (0..items.len()).map(|i| i.to_string()).collect(),
                _ => continue,
            };

            for child in children {
                let mut path = format!("{base}.{child}");
                if !rest.is_empty() {
                    path.push('.');
                    path.push_str(rest);
                }
                set_value(root, &path, &rendered, replacement.if_value.as_deref());
            }
        } else {
            set_value(root, &replacement.matches, &rendered, replacement.if_value.as_deref());
        }
    }
}

/// Sets one dot-path to the rendered value, honoring `if_value` gating.
fn set_value(root: &mut Value, path: &str, rendered: &str, if_value: Option<&str>) {
    match if_value {
        Some(gate) if gate.starts_with("regex:") => {
            // Regex gate: substitution on the existing value, skipped when
            // the path does not exist or the pattern does not compile.
            let pattern = gate.trim_start_matches("regex:");
            let Ok(re) = Regex::new(pattern) else {
                tracing::warn!(pattern, "if_value uses an invalid regex, skipping replacement");
                return;
            };
            let Some(existing) = get_path(root, path) else {
                return;
            };
            let existing_str = value_to_string(existing);
            if !re.is_match(&existing_str) {
                return;
            }
            let substituted = re.replace_all(&existing_str, rendered).into_owned();
            let coerced = coerce(Some(existing), &substituted);
            let _ = put_path(root, path, coerced, false);
        }
        Some(gate) => {
            let Some(existing) = get_path(root, path) else {
                return;
            };
            if value_to_string(existing) != gate {
                return;
            }
            let coerced = coerce(Some(existing), rendered);
            let _ = put_path(root, path, coerced, false);
        }
        None => {
            let existing = get_path(root, path);
            let coerced = coerce(existing, rendered);
            let _ = put_path(root, path, coerced, true);
        }
    }
}

/// Coerces the rendered string using the existing value's type: booleans
/// stay boolean, anything that parses as an integer becomes one, the rest
/// stays a string.
pub(crate) fn coerce(existing: Option<&Value>, rendered: &str) -> Value {
    if matches!(existing, Some(Value::Bool(_))) {
        return Value::Bool(matches!(rendered, "true" | "1" | "yes" | "on"));
    }
    if let Ok(n) = rendered.parse::<i64>() {
        return Value::Number(n.into());
    }
    Value::String(rendered.to_string())
}

pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Reads a dot-path, treating numeric segments as array indices.
pub(crate) fn get_path<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(root);
    }
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Writes a dot-path. With `create`, missing intermediate objects are
/// created; an intermediate of the wrong shape, or an array index out of
/// bounds, skips the write.
fn put_path(root: &mut Value, path: &str, value: Value, create: bool) -> Option<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        match current {
            Value::Object(map) => {
                if last {
                    map.insert((*segment).to_string(), value);
                    return Some(());
                }
                if !map.contains_key(*segment) {
                    if !create {
                        return None;
                    }
                    map.insert(
                        (*segment).to_string(),
                        Value::Object(serde_json::Map::new()),
                    );
                }
                current = map.get_mut(*segment)?;
            }
            Value::Array(items) => {
                let index = segment.parse::<usize>().ok()?;
                if last {
                    *items.get_mut(index)? = value;
                    return Some(());
                }
                current = items.get_mut(index)?;
            }
            _ => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfigurationFile, ParserKind};
    use serde_json::json;

    fn rule(matches: &str, replace_with: Value) -> Replacement {
        Replacement {
            matches: matches.to_string(),
            if_value: None,
            replace_with,
        }
    }

    fn parse_json(contents: &str, replacements: Vec<Replacement>) -> Value {
        let file = ConfigurationFile {
            file: "config.json".into(),
            parser: ParserKind::Json,
            replace: replacements,
            allow_create: true,
        };
        let out = file.parse(contents.as_bytes(), &json!({})).unwrap();
        serde_json::from_slice(&out).unwrap()
    }

    #[test]
    fn sets_nested_value_with_coercion() {
        let out = parse_json(
            r#"{"server": {"port": 8080, "online": false}}"#,
            vec![
                rule("server.port", json!("25565")),
                rule("server.online", json!("true")),
            ],
        );
        assert_eq!(out["server"]["port"], json!(25565));
        assert_eq!(out["server"]["online"], json!(true));
    }

    #[test]
    fn creates_missing_leaf_and_parents() {
        let out = parse_json("{}", vec![rule("query.port", json!("25565"))]);
        assert_eq!(out["query"]["port"], json!(25565));
    }

    #[test]
    fn wildcard_fans_out_over_children() {
        let out = parse_json(
            r#"{"worlds": {"lobby": {"ip": "old"}, "pvp": {"ip": "old"}}}"#,
            vec![rule("worlds.*.ip", json!("0.0.0.0"))],
        );
        assert_eq!(out["worlds"]["lobby"]["ip"], json!("0.0.0.0"));
        assert_eq!(out["worlds"]["pvp"]["ip"], json!("0.0.0.0"));
    }

    #[test]
    fn wildcard_over_array() {
        let out = parse_json(
            r#"{"listeners": [{"host": "old"}, {"host": "old"}]}"#,
            vec![rule("listeners.*.host", json!("0.0.0.0:25577"))],
        );
        assert_eq!(out["listeners"][0]["host"], json!("0.0.0.0:25577"));
        assert_eq!(out["listeners"][1]["host"], json!("0.0.0.0:25577"));
    }

    #[test]
    fn wildcard_missing_base_is_skipped() {
        let out = parse_json("{}", vec![rule("missing.*.ip", json!("x"))]);
        assert_eq!(out, json!({}));
    }

    #[test]
    fn if_value_literal_gates_replacement() {
        let gated = Replacement {
            matches: "motd".into(),
            if_value: Some("A Minecraft Server".into()),
            replace_with: json!("Welcome!"),
        };
        let out = parse_json(r#"{"motd": "A Minecraft Server"}"#, vec![gated.clone()]);
        assert_eq!(out["motd"], json!("Welcome!"));

        let untouched = parse_json(r#"{"motd": "custom"}"#, vec![gated]);
        assert_eq!(out["motd"], json!("Welcome!"));
        assert_eq!(untouched["motd"], json!("custom"));
    }

    #[test]
    fn if_value_regex_substitutes() {
        let gated = Replacement {
            matches: "address".into(),
            if_value: Some("regex:^0\\.0\\.0\\.0:(\\d+)$".into()),
            replace_with: json!("127.0.0.1:$1"),
        };
        let out = parse_json(r#"{"address": "0.0.0.0:25565"}"#, vec![gated]);
        assert_eq!(out["address"], json!("127.0.0.1:25565"));
    }

    #[test]
    fn if_value_missing_path_is_skipped() {
        let gated = Replacement {
            matches: "absent.path".into(),
            if_value: Some("whatever".into()),
            replace_with: json!("x"),
        };
        let out = parse_json("{}", vec![gated]);
        assert_eq!(out, json!({}));
    }

    #[test]
    fn yaml_roundtrip() {
        let file = ConfigurationFile {
            file: "config.yml".into(),
            parser: ParserKind::Yaml,
            replace: vec![rule("settings.query-port", json!("25565"))],
            allow_create: true,
        };
        let out = file
            .parse(b"settings:\n  query-port: 0\n  motd: hi\n", &json!({}))
            .unwrap();
        let parsed: Value = serde_yaml::from_slice(&out).unwrap();
        assert_eq!(parsed["settings"]["query-port"], json!(25565));
        assert_eq!(parsed["settings"]["motd"], json!("hi"));
    }
}

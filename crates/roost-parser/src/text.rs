//! Line-oriented rewriters: properties, ini, and the raw `file` kind.

use serde_json::Value;

use crate::lookup::resolve_config_references;
use crate::{Replacement, Result};

/// Decides the replacement text for one matched `key=value` line, honoring
/// the optional `if_value` gate. `None` leaves the line untouched.
fn rewrite_line(key: &str, current: &str, rendered: &str, if_value: Option<&str>) -> Option<String> {
    match if_value {
        Some(gate) if gate.starts_with("regex:") => {
            regex_substitute(gate, current.trim(), rendered).map(|sub| format!("{key}={sub}"))
        }
        Some(gate) => (current.trim() == gate).then(|| format!("{key}={rendered}")),
        None => Some(format!("{key}={rendered}")),
    }
}

/// For `regex:` gates, returns the substituted value when the pattern
/// matches the current value.
fn regex_substitute(gate: &str, current: &str, rendered: &str) -> Option<String> {
    let pattern = gate.strip_prefix("regex:")?;
    let re = regex::Regex::new(pattern).ok()?;
    if !re.is_match(current) {
        return None;
    }
    Some(re.replace_all(current, rendered).into_owned())
}

/// Rewrites a Java-style properties file. Comments and unknown lines are
/// preserved; matched keys are rewritten in place and missing keys are
/// appended at the end.
pub(crate) fn rewrite_properties(
    contents: &[u8],
    replacements: &[Replacement],
    config: &Value,
) -> Result<Vec<u8>> {
    let text = String::from_utf8_lossy(contents);
    let mut lines: Vec<String> = text.lines().map(ToString::to_string).collect();
    let mut pending: Vec<String> = Vec::new();

    for replacement in replacements {
        let rendered = resolve_config_references(&replacement.replace_with, config);
        let key = replacement.matches.as_str();
        let mut found = false;

        for line in &mut lines {
            let new_line = {
                let trimmed = line.trim_start();
                if trimmed.starts_with('#') || trimmed.starts_with('!') {
                    None
                } else {
                    match trimmed.split_once('=') {
                        Some((line_key, current)) if line_key.trim() == key => {
                            found = true;
                            rewrite_line(key, current, &rendered, replacement.if_value.as_deref())
                        }
                        _ => None,
                    }
                }
            };
            if let Some(new_line) = new_line {
                *line = new_line;
            }
        }

        if !found && replacement.if_value.is_none() {
            pending.push(format!("{key}={rendered}"));
        }
    }

    lines.append(&mut pending);
    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out.into_bytes())
}

/// Rewrites an INI file. The match path is `section.key`, or a bare `key`
/// for the unsectioned prefix. Missing keys are appended to their section,
/// creating the section when necessary.
pub(crate) fn rewrite_ini(
    contents: &[u8],
    replacements: &[Replacement],
    config: &Value,
) -> Result<Vec<u8>> {
    let text = String::from_utf8_lossy(contents);
    let mut lines: Vec<String> = text.lines().map(ToString::to_string).collect();

    for replacement in replacements {
        let rendered = resolve_config_references(&replacement.replace_with, config);
        let (section, key) = match replacement.matches.split_once('.') {
            Some((s, k)) => (Some(s), k),
            None => (None, replacement.matches.as_str()),
        };

        let mut current_section: Option<String> = None;
        let mut section_end: Option<usize> = if section.is_none() { Some(0) } else { None };
        let mut found = false;

        for (i, line) in lines.iter_mut().enumerate() {
            let mut new_line = None;
            {
                let trimmed = line.trim();
                if trimmed.starts_with('[') && trimmed.ends_with(']') {
                    current_section = Some(trimmed[1..trimmed.len() - 1].to_string());
                    if section == current_section.as_deref() {
                        section_end = Some(i + 1);
                    }
                } else if section == current_section.as_deref() {
                    if !trimmed.starts_with(';') && !trimmed.starts_with('#') {
                        if let Some((line_key, current)) = trimmed.split_once('=') {
                            if line_key.trim() == key {
                                found = true;
                                new_line = rewrite_line(
                                    key,
                                    current,
                                    &rendered,
                                    replacement.if_value.as_deref(),
                                );
                            }
                        }
                    }
                    section_end = Some(i + 1);
                }
            }
            if let Some(new_line) = new_line {
                *line = new_line;
            }
        }

        if !found && replacement.if_value.is_none() {
            match section_end {
                Some(at) => lines.insert(at, format!("{key}={rendered}")),
                None => {
                    if let Some(section) = section {
                        lines.push(format!("[{section}]"));
                    }
                    lines.push(format!("{key}={rendered}"));
                }
            }
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out.into_bytes())
}

/// Rewrites the raw `file` kind: `match` is the prefix before a delimiter,
/// and a matching line has its suffix rewritten. Lines with no matching
/// rule pass through untouched.
pub(crate) fn rewrite_file(
    contents: &[u8],
    replacements: &[Replacement],
    config: &Value,
) -> Result<Vec<u8>> {
    let text = String::from_utf8_lossy(contents);
    let mut lines: Vec<String> = text.lines().map(ToString::to_string).collect();

    for replacement in replacements {
        let rendered = resolve_config_references(&replacement.replace_with, config);
        for line in &mut lines {
            if line.starts_with(replacement.matches.as_str()) {
                *line = format!("{}{rendered}", replacement.matches);
            }
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfigurationFile, ParserKind};
    use serde_json::json;

    fn rule(matches: &str, value: &str) -> Replacement {
        Replacement {
            matches: matches.to_string(),
            if_value: None,
            replace_with: json!(value),
        }
    }

    fn run(kind: ParserKind, contents: &str, replace: Vec<Replacement>) -> String {
        let file = ConfigurationFile {
            file: "f".into(),
            parser: kind,
            replace,
            allow_create: true,
        };
        String::from_utf8(file.parse(contents.as_bytes(), &json!({})).unwrap()).unwrap()
    }

    #[test]
    fn properties_rewrites_and_appends() {
        let out = run(
            ParserKind::Properties,
            "# Minecraft server properties\nserver-port=8080\nmotd=hello\n",
            vec![rule("server-port", "25565"), rule("query.port", "25565")],
        );
        assert!(out.contains("# Minecraft server properties\n"));
        assert!(out.contains("server-port=25565\n"));
        assert!(out.contains("motd=hello\n"));
        assert!(out.ends_with("query.port=25565\n"));
    }

    #[test]
    fn properties_if_value_gate() {
        let gated = Replacement {
            matches: "motd".into(),
            if_value: Some("A Minecraft Server".into()),
            replace_with: json!("Welcome"),
        };
        let out = run(ParserKind::Properties, "motd=custom text\n", vec![gated.clone()]);
        assert!(out.contains("motd=custom text"));

        let out = run(ParserKind::Properties, "motd=A Minecraft Server\n", vec![gated]);
        assert!(out.contains("motd=Welcome"));
    }

    #[test]
    fn properties_regex_gate_substitutes() {
        let gated = Replacement {
            matches: "server-ip".into(),
            if_value: Some("regex:^0\\.0\\.0\\.0$".into()),
            replace_with: json!("172.18.0.1"),
        };
        let out = run(ParserKind::Properties, "server-ip=0.0.0.0\n", vec![gated]);
        assert!(out.contains("server-ip=172.18.0.1"));
    }

    #[test]
    fn ini_rewrites_inside_section() {
        let out = run(
            ParserKind::Ini,
            "[ServerSettings]\nport=7777\n\n[Other]\nport=1\n",
            vec![rule("ServerSettings.port", "77777")],
        );
        assert!(out.contains("[ServerSettings]\nport=77777"));
        assert!(out.contains("[Other]\nport=1"));
    }

    #[test]
    fn ini_appends_missing_section() {
        let out = run(ParserKind::Ini, "", vec![rule("Network.ip", "0.0.0.0")]);
        assert!(out.contains("[Network]\nip=0.0.0.0"));
    }

    #[test]
    fn ini_top_level_key() {
        let out = run(
            ParserKind::Ini,
            "name=old\n[Section]\nname=keep\n",
            vec![rule("name", "new")],
        );
        assert!(out.starts_with("name=new\n"));
        assert!(out.contains("[Section]\nname=keep"));
    }

    #[test]
    fn file_kind_rewrites_suffix() {
        let out = run(
            ParserKind::File,
            "serverip=1.2.3.4\nserverport=1111\nother line\n",
            vec![rule("serverip=", "0.0.0.0"), rule("serverport=", "25565")],
        );
        assert_eq!(out, "serverip=0.0.0.0\nserverport=25565\nother line\n");
    }
}

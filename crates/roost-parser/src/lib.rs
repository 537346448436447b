//! Process-configuration file rewriting.
//!
//! Before a server starts, the files its process reads are rewritten to
//! embed per-deployment values: ports, memory limits, the daemon's own
//! network interface, and so on. Each rule names a file, a parser kind, and
//! a list of dot-path replacements whose values may reference the daemon
//! configuration with `{{ config.a.b }}` placeholders.
//!
//! Rewriting is pure: bytes in, bytes out. The server layer owns opening
//! and writing the files through the sandboxed filesystem.

mod lookup;
mod text;
mod value;
mod xml;

pub use lookup::resolve_config_references;

use std::collections::HashMap;

use roost_error::CommonError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Result type alias for parser operations.
pub type Result<T> = std::result::Result<T, ParserError>;

/// Errors from rewriting a configuration file.
#[derive(Debug, Error)]
pub enum ParserError {
    #[error(transparent)]
    Common(#[from] CommonError),

    /// The file's contents did not parse as the declared format.
    #[error("invalid {kind} content: {message}")]
    InvalidFormat { kind: &'static str, message: String },
}

impl ParserError {
    fn invalid(kind: &'static str, message: impl ToString) -> Self {
        Self::InvalidFormat {
            kind,
            message: message.to_string(),
        }
    }
}

/// Supported file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserKind {
    File,
    Yaml,
    Properties,
    Ini,
    Json,
    Xml,
}

/// One value replacement inside a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replacement {
    /// Dot-separated path; one `.*` segment fans out over every child of
    /// the preceding path.
    #[serde(rename = "match")]
    pub matches: String,
    /// Optional gate: a literal the current value must equal, or
    /// `regex:<pattern>` for substitution instead of overwrite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_value: Option<String>,
    /// Replacement value; strings may reference `{{ config.* }}`.
    pub replace_with: Value,
}

/// A file-rewriting rule from the server's egg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationFile {
    /// File name relative to the server root; may contain `{{ VAR }}` or
    /// `${VAR}` environment placeholders.
    pub file: String,
    pub parser: ParserKind,
    #[serde(default)]
    pub replace: Vec<Replacement>,
    /// Whether the file may be created when missing. The Panel omits the
    /// field for the common case, which is create-on-demand.
    #[serde(default = "default_true", rename = "create")]
    pub allow_create: bool,
}

fn default_true() -> bool {
    true
}

impl ConfigurationFile {
    /// Substitutes `{{ VAR }}` / `${VAR}` environment references in the
    /// file name.
    #[must_use]
    pub fn resolved_name(&self, env: &HashMap<String, String>) -> String {
        // The overwhelming majority of rules carry no placeholder at all.
        if !self.file.contains('{') && !self.file.contains('$') {
            return self.file.clone();
        }
        let mut name = self.file.replace("{{", "${").replace("}}", "}");
        for (key, value) in env {
            name = name.replace(&format!("${{{key}}}"), value);
        }
        name
    }

    /// Rewrites `contents` according to this rule. `config` is the daemon's
    /// own configuration as JSON, consulted for `{{ config.* }}` lookups.
    pub fn parse(&self, contents: &[u8], config: &Value) -> Result<Vec<u8>> {
        match self.parser {
            ParserKind::Json => value::rewrite_json(contents, &self.replace, config),
            ParserKind::Yaml => value::rewrite_yaml(contents, &self.replace, config),
            ParserKind::Properties => text::rewrite_properties(contents, &self.replace, config),
            ParserKind::Ini => text::rewrite_ini(contents, &self.replace, config),
            ParserKind::File => text::rewrite_file(contents, &self.replace, config),
            ParserKind::Xml => xml::rewrite_xml(contents, &self.replace, config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_egg_shape() {
        let raw = json!({
            "file": "server.properties",
            "parser": "properties",
            "replace": [
                {"match": "server-port", "replace_with": "{{server.build.default.port}}"},
                {"match": "motd", "if_value": "A Minecraft Server", "replace_with": "Welcome"}
            ]
        });
        let file: ConfigurationFile = serde_json::from_value(raw).unwrap();
        assert_eq!(file.parser, ParserKind::Properties);
        assert!(file.allow_create);
        assert_eq!(file.replace.len(), 2);
        assert_eq!(file.replace[1].if_value.as_deref(), Some("A Minecraft Server"));
    }

    #[test]
    fn filename_substitution() {
        let file = ConfigurationFile {
            file: "configs/{{SERVER_NAME}}/settings.yml".into(),
            parser: ParserKind::Yaml,
            replace: vec![],
            allow_create: true,
        };
        let env = HashMap::from([("SERVER_NAME".to_string(), "lobby".to_string())]);
        assert_eq!(file.resolved_name(&env), "configs/lobby/settings.yml");

        let plain = ConfigurationFile {
            file: "config.yml".into(),
            parser: ParserKind::Yaml,
            replace: vec![],
            allow_create: true,
        };
        assert_eq!(plain.resolved_name(&env), "config.yml");
    }
}

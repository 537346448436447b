//! File-name search across a server's tree.

use roost_error::{CommonError, Result};
use serde::Serialize;

use crate::fs::FileInfo;
use crate::walk::WalkAction;
use crate::Filesystem;

/// Directory names never descended into by default; match is substring,
/// case-insensitive.
pub const DEFAULT_BLACKLIST: &[&str] = &["node_modules", ".wine", "appcache", "depotcache", "vendor"];

/// Search parameters.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// `*`/`?` glob, substring, or `.ext` extension pattern; at least three
    /// characters.
    pub pattern: String,
    /// Maximum directory depth below the starting directory.
    pub max_depth: usize,
    /// Cap on returned matches.
    pub max_results: usize,
    /// Directory-name substrings to skip.
    pub blacklist: Vec<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            max_depth: 8,
            max_results: 250,
            blacklist: DEFAULT_BLACKLIST.iter().map(ToString::to_string).collect(),
        }
    }
}

/// One match: the root-relative path plus its metadata.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub path: String,
    #[serde(flatten)]
    pub info: FileInfo,
}

enum Matcher {
    Glob(regex::Regex),
    Substring(String),
}

impl Matcher {
    fn build(pattern: &str) -> Result<Self> {
        let lower = pattern.to_lowercase();
        if lower.contains(['*', '?']) {
            let mut re = String::from("^");
            for ch in lower.chars() {
                match ch {
                    '*' => re.push_str("[^/]*"),
                    '?' => re.push_str("[^/]"),
                    c => re.push_str(&regex::escape(&c.to_string())),
                }
            }
            re.push('$');
            let re = regex::Regex::new(&re)
                .map_err(|e| CommonError::invalid_input(format!("bad search pattern: {e}")))?;
            Ok(Self::Glob(re))
        } else {
            Ok(Self::Substring(lower))
        }
    }

    fn matches(&self, name_lower: &str) -> bool {
        match self {
            Self::Glob(re) => re.is_match(name_lower),
            Self::Substring(pat) => {
                if name_lower.contains(pat.as_str()) {
                    return true;
                }
                // Extension matching: ".jar" or "jar" both match *.jar when
                // the pattern carries no other dot-separated structure.
                let ext = name_lower.rsplit('.').next().unwrap_or("");
                if pat.starts_with('.') || !pat.contains('.') {
                    ext == pat.trim_start_matches('.')
                } else {
                    name_lower == pat.as_str()
                }
            }
        }
    }
}

impl Filesystem {
    /// Searches for entries whose name matches the pattern, starting at
    /// `dir`. Blacklisted directories are skipped entirely and recursion is
    /// bounded by `max_depth`.
    pub fn search(&self, dir: &str, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        if opts.pattern.chars().count() < 3 {
            return Err(CommonError::invalid_input(
                "search pattern must be at least 3 characters long",
            ));
        }
        let matcher = Matcher::build(&opts.pattern)?;
        let base_depth = crate::path::sanitize(dir)?.components().count();

        let mut results = Vec::new();
        self.walk(dir, &mut |parent, entry| {
            if results.len() >= opts.max_results {
                return Ok(WalkAction::SkipDir);
            }

            let name_lower = entry.name().to_string_lossy().to_lowercase();

            if entry.is_dir() {
                let depth = parent.components().count().saturating_sub(base_depth) + 1;
                let blacklisted = opts
                    .blacklist
                    .iter()
                    .any(|b| name_lower.contains(&b.to_lowercase()));
                if blacklisted || depth > opts.max_depth {
                    return Ok(WalkAction::SkipDir);
                }
            }

            if matcher.matches(&name_lower) {
                if let Ok(info) = entry.info() {
                    results.push(SearchResult {
                        path: parent.join(entry.name()).to_string_lossy().into_owned(),
                        info,
                    });
                }
            }
            Ok(WalkAction::Continue)
        })?;

        Ok(results)
    }
}

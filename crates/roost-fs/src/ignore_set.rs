//! Gitignore-style exclusion sets for backups and transfers.

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use roost_error::{CommonError, Result};

use crate::Filesystem;

/// Name of the optional exclusion file at a server root.
pub const IGNORE_FILE: &str = ".ignore";

/// A compiled set of gitignore patterns.
///
/// Lines follow gitignore semantics: leading `!` negates, a leading `/`
/// anchors to the server root, a trailing `/` matches directories only.
pub struct IgnoreSet {
    matcher: Gitignore,
}

impl IgnoreSet {
    /// An empty set that ignores nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            matcher: Gitignore::empty(),
        }
    }

    /// Compiles a set from raw pattern text (one pattern per line).
    pub fn from_text(text: &str) -> Result<Self> {
        let mut builder = GitignoreBuilder::new("");
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            builder
                .add_line(None, line)
                .map_err(|e| CommonError::invalid_input(format!("bad ignore pattern {line:?}: {e}")))?;
        }
        let matcher = builder
            .build()
            .map_err(|e| CommonError::invalid_input(format!("bad ignore set: {e}")))?;
        Ok(Self { matcher })
    }

    /// Combines the server root's `.ignore` file (if present) with
    /// caller-supplied patterns.
    pub fn for_server(fs: &Filesystem, extra: &str) -> Result<Self> {
        let mut text = String::new();
        match fs.read(IGNORE_FILE) {
            Ok(bytes) => text.push_str(&String::from_utf8_lossy(&bytes)),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        if !extra.is_empty() {
            text.push('\n');
            text.push_str(extra);
        }
        Self::from_text(&text)
    }

    /// True when the root-relative path is excluded.
    #[must_use]
    pub fn is_ignored(&self, rel: &Path, is_dir: bool) -> bool {
        self.matcher
            .matched_path_or_any_parents(rel, is_dir)
            .is_ignore()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_patterns() {
        let set = IgnoreSet::from_text("*.log\ncache/\n!keep.log").unwrap();
        assert!(set.is_ignored(Path::new("server.log"), false));
        assert!(set.is_ignored(Path::new("logs/old.log"), false));
        assert!(!set.is_ignored(Path::new("keep.log"), false));
        assert!(set.is_ignored(Path::new("cache"), true));
        assert!(set.is_ignored(Path::new("cache/session.bin"), false));
        assert!(!set.is_ignored(Path::new("world/level.dat"), false));
    }

    #[test]
    fn anchored_patterns() {
        let set = IgnoreSet::from_text("/config.yml").unwrap();
        assert!(set.is_ignored(Path::new("config.yml"), false));
        assert!(!set.is_ignored(Path::new("plugins/config.yml"), false));
    }

    #[test]
    fn empty_ignores_nothing() {
        let set = IgnoreSet::empty();
        assert!(!set.is_ignored(Path::new("anything"), false));
    }
}

// SPDX-License-Identifier: Apache-2.0

//! Glob patterns split into a literal base directory and a match predicate.
//!
//! The base directory is what gets registered with the file-system watcher
//! or re-listed by the poller; the predicate decides whether an entry inside
//! it is tailed.

use glob::Pattern;
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::tailer::error::{Result, TailError};

#[derive(Debug, Clone)]
pub struct Glob {
    raw: String,
    pattern: Pattern,
    dir: PathBuf,
}

fn has_wildcard(component: &str) -> bool {
    component.contains('*') || component.contains('?') || component.contains('[')
}

impl Glob {
    /// Compile a pattern and extract the greatest path prefix containing no
    /// wildcards. Patterns whose component names escape their base directory
    /// are rejected.
    pub fn from_pattern(raw: &str) -> Result<Glob> {
        let pattern = Pattern::new(raw).map_err(|e| {
            TailError::unspecified(format!("invalid glob pattern {:?}: {}", raw, e))
        })?;

        let path = Path::new(raw);
        let mut dir = PathBuf::new();
        for component in path.components() {
            if matches!(component, Component::ParentDir) {
                return Err(TailError::unspecified(format!(
                    "glob pattern {:?} escapes its base directory",
                    raw
                )));
            }
            let name = component.as_os_str().to_string_lossy();
            if has_wildcard(&name) {
                break;
            }
            dir.push(component);
        }

        // A literal path with no wildcards names a file; its base is the parent.
        if dir == path {
            dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        }
        if dir.as_os_str().is_empty() {
            dir = PathBuf::from(".");
        }

        Ok(Glob {
            raw: raw.to_string(),
            pattern,
            dir,
        })
    }

    /// The longest literal prefix directory of the pattern.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn matches(&self, path: &Path) -> bool {
        self.pattern.matches_path(path)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// True when `path` matches at least one include glob and no exclude glob.
pub fn match_any(path: &Path, include: &[Glob], exclude: &[Glob]) -> bool {
    include.iter().any(|g| g.matches(path)) && !exclude.iter().any(|g| g.matches(path))
}

/// Compile a list of patterns.
pub fn globs_from_patterns(patterns: &[String]) -> Result<Vec<Glob>> {
    patterns.iter().map(|p| Glob::from_pattern(p)).collect()
}

/// Collect the deduplicated base directories of `globs`, asserting each one
/// exists and is a directory.
pub fn expand_globs(globs: &[Glob]) -> Result<HashSet<PathBuf>> {
    let mut dirs = HashSet::new();
    for g in globs {
        if dirs.contains(g.dir()) {
            continue;
        }
        let meta = fs::metadata(g.dir()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TailError::directory_not_found(format!("{:?}: no such directory", g.dir()))
            } else {
                TailError::unspecified(format!("{:?}: stat() failed", g.dir())).with_cause(e)
            }
        })?;
        if !meta.is_dir() {
            return Err(TailError::unspecified(format!(
                "{:?} is not a directory",
                g.dir()
            )));
        }
        dirs.insert(g.dir().to_path_buf());
    }
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tailer::error::ErrorKind;
    use tempfile::TempDir;

    #[test]
    fn extracts_literal_prefix_dir() {
        let g = Glob::from_pattern("/var/log/nginx/*.log").unwrap();
        assert_eq!(g.dir(), Path::new("/var/log/nginx"));

        let g = Glob::from_pattern("/var/log/app-*/current.log").unwrap();
        assert_eq!(g.dir(), Path::new("/var/log"));
    }

    #[test]
    fn literal_path_uses_parent_dir() {
        let g = Glob::from_pattern("/var/log/syslog").unwrap();
        assert_eq!(g.dir(), Path::new("/var/log"));
    }

    #[test]
    fn relative_pattern_uses_current_dir() {
        let g = Glob::from_pattern("*.log").unwrap();
        assert_eq!(g.dir(), Path::new("."));
    }

    #[test]
    fn rejects_parent_dir_escape() {
        assert!(Glob::from_pattern("/var/log/../etc/*.conf").is_err());
        assert!(Glob::from_pattern("../*.log").is_err());
    }

    #[test]
    fn rejects_invalid_syntax() {
        assert!(Glob::from_pattern("/var/log/[").is_err());
    }

    #[test]
    fn matches_and_excludes() {
        let include = vec![Glob::from_pattern("/var/log/*.log").unwrap()];
        let exclude = vec![Glob::from_pattern("/var/log/*_debug.log").unwrap()];

        assert!(match_any(Path::new("/var/log/app.log"), &include, &exclude));
        assert!(!match_any(
            Path::new("/var/log/app_debug.log"),
            &include,
            &exclude
        ));
        assert!(!match_any(Path::new("/var/log/app.txt"), &include, &exclude));
    }

    #[test]
    fn expand_globs_dedupes_dirs() {
        let dir = TempDir::new().unwrap();
        let a = format!("{}/*.log", dir.path().display());
        let b = format!("{}/*.out", dir.path().display());
        let globs = globs_from_patterns(&[a, b]).unwrap();

        let dirs = expand_globs(&globs).unwrap();
        assert_eq!(dirs.len(), 1);
        assert!(dirs.contains(dir.path()));
    }

    #[test]
    fn expand_globs_missing_dir_is_fatal() {
        let globs = vec![Glob::from_pattern("/definitely/not/here/*.log").unwrap()];
        let err = expand_globs(&globs).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DirectoryNotFound);
    }

    #[test]
    fn expand_globs_rejects_file_as_dir() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain.txt");
        std::fs::write(&file, "x").unwrap();

        let pattern = format!("{}/*", file.display());
        let globs = vec![Glob::from_pattern(&pattern).unwrap()];
        let err = expand_globs(&globs).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unspecified);
    }
}

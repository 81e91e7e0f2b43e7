//! Source-import scanning.
//!
//! The loader consumes imports through the `ImportScanner` seam: given a
//! package directory, it reports the import paths referenced by non-test
//! and test files. `SourceScanner` is the filesystem implementation for
//! Keel sources: `.kl` files, with `*_test.kl` files contributing the
//! test-only import set.

use std::io;
use std::path::Path;

/// Imports referenced by one package directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScannedImports {
    /// Imports of non-test files, sorted and deduplicated.
    pub imports: Vec<String>,
    /// Imports referenced only by test files.
    pub test_imports: Vec<String>,
}

/// Scans a package directory for the imports its sources reference.
pub trait ImportScanner: Send + Sync {
    fn scan_dir(&self, dir: &Path) -> io::Result<ScannedImports>;
}

/// The filesystem scanner for Keel source files.
///
/// An import is a line of the form `import "path"`, read from the top of
/// each file until the first non-import, non-comment, non-blank line.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceScanner;

impl ImportScanner for SourceScanner {
    fn scan_dir(&self, dir: &Path) -> io::Result<ScannedImports> {
        let mut imports = Vec::new();
        let mut test_imports = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".kl") || !path.is_file() {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            let target = if name.ends_with("_test.kl") {
                &mut test_imports
            } else {
                &mut imports
            };
            target.extend(file_imports(&content));
        }

        imports.sort();
        imports.dedup();
        test_imports.sort();
        test_imports.dedup();
        // An import already needed by non-test files is not test-only.
        test_imports.retain(|p| imports.binary_search(p).is_err());

        Ok(ScannedImports {
            imports,
            test_imports,
        })
    }
}

fn file_imports(content: &str) -> Vec<String> {
    let mut found = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        let Some(rest) = line.strip_prefix("import ") else {
            break;
        };
        if let Some(path) = quoted(rest.trim()) {
            found.push(path.to_string());
        }
    }
    found
}

fn quoted(s: &str) -> Option<&str> {
    let rest = s.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(&rest[..end])
}

/// Whether a directory directly contains Keel source files, which is what
/// makes it a package.
pub fn has_source_files(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".kl"))
        {
            return true;
        }
    }
    false
}

/// Enumerate the package directories under a module root, as module-relative
/// slash paths ("" for the root package itself). Sorted for determinism.
pub fn walk_packages(root: &Path) -> io::Result<Vec<String>> {
    let mut found = Vec::new();
    let mut stack = vec![(root.to_path_buf(), String::new())];
    while let Some((dir, rel)) = stack.pop() {
        if has_source_files(&dir) {
            found.push(rel.clone());
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let child_rel = if rel.is_empty() {
                name.to_string()
            } else {
                format!("{rel}/{name}")
            };
            stack.push((path, child_rel));
        }
    }
    found.sort();
    Ok(found)
}

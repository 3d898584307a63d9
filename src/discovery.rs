//! Resolving command-line targets into importable module names.
//!
//! Each target is a directory containing source files, one source
//! file, or a dotted name the runtime can import. Directories and
//! files are walked *upward* while a package-marker file exists, so
//! the result is always an import root plus a fully dotted prefix.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Extension of user source files.
pub const SOURCE_EXTENSION: &str = "py";
/// A directory containing this file is a package.
pub const PACKAGE_MARKER: &str = "__init__.py";

/// Words that look like identifiers but cannot name a module.
const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// A resolved command-line argument: a directory to put on the
/// import path (absent for plain dotted names) and a dotted prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub root: Option<PathBuf>,
    pub name: String,
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let leading_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    leading_ok
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !KEYWORDS.contains(&name)
}

/// The module name a source filename would import as, if any.
pub fn module_name_of(filename: &str) -> Option<&str> {
    let base = filename.strip_suffix(".py")?;
    if is_identifier(base) {
        Some(base)
    } else {
        None
    }
}

/// Interpret one name from the command line.
pub fn interpret_argument(name: &str) -> Result<Target> {
    let path = Path::new(name);
    if path.is_dir() {
        return discover_enclosing_packages(path, Vec::new());
    }
    if path.is_file() {
        let Some(stem) = path.file_name().and_then(|n| n.to_str()).and_then(module_name_of)
        else {
            bail!("test file lacks a .{SOURCE_EXTENSION} extension: {name}");
        };
        let directory = path.parent().unwrap_or_else(|| Path::new("."));
        return discover_enclosing_packages(directory, vec![stem.to_string()]);
    }
    if !name.is_empty() && name.split('.').all(is_identifier) {
        return Ok(Target {
            root: None,
            name: name.to_string(),
        });
    }
    bail!("can neither open nor import: {name}")
}

/// Walk upward while a package marker exists, accumulating the
/// dotted prefix.
fn discover_enclosing_packages(directory: &Path, mut names: Vec<String>) -> Result<Target> {
    let mut directory = directory
        .canonicalize()
        .unwrap_or_else(|_| directory.to_path_buf());
    while is_package(&directory) {
        let Some(package_name) = directory.file_name().and_then(|n| n.to_str()) else {
            bail!("a package marker file should not sit at the filesystem root");
        };
        if !is_identifier(package_name) {
            bail!(
                "directory contains {PACKAGE_MARKER} but its name is not an identifier: {package_name}"
            );
        }
        names.push(package_name.to_string());
        directory = match directory.parent() {
            Some(parent) => parent.to_path_buf(),
            None => bail!("a package marker file should not sit at the filesystem root"),
        };
    }
    names.reverse();
    Ok(Target {
        root: Some(directory),
        name: names.join("."),
    })
}

fn is_package(directory: &Path) -> bool {
    directory.join(PACKAGE_MARKER).is_file()
}

/// Expand a target into the module names to test.
pub fn search(target: &Target) -> Vec<String> {
    let Some(ref root) = target.root else {
        return vec![target.name.clone()];
    };
    let base = if target.name.is_empty() {
        root.clone()
    } else {
        let mut dir = root.clone();
        for part in target.name.split('.') {
            dir.push(part);
        }
        dir
    };
    if !base.is_dir()
        && (base.is_file() || base.with_extension(SOURCE_EXTENSION).is_file())
    {
        // a single module
        return vec![target.name.clone()];
    }

    let mut modules = Vec::new();
    if !target.name.is_empty() {
        modules.push(target.name.clone());
    }
    let walker = WalkDir::new(&base)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() > 0 && entry.file_type().is_dir() {
                // only descend through packages
                return is_package(entry.path());
            }
            true
        });
    for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(filename) = entry.file_name().to_str() else {
            continue;
        };
        if filename == PACKAGE_MARKER {
            continue;
        }
        let Some(stem) = module_name_of(filename) else {
            continue;
        };
        let mut dotted: Vec<&str> = if target.name.is_empty() {
            Vec::new()
        } else {
            target.name.split('.').collect()
        };
        let relative = entry.path().strip_prefix(&base).unwrap_or(entry.path());
        for component in relative.parent().into_iter().flat_map(|p| p.components()) {
            if let std::path::Component::Normal(part) = component {
                if let Some(part) = part.to_str() {
                    dotted.push(part);
                }
            }
        }
        dotted.push(stem);
        modules.push(dotted.join("."));
    }
    modules.sort();
    modules.dedup();
    modules
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn identifiers_and_keywords() {
        assert!(is_identifier("alpha"));
        assert!(is_identifier("_private"));
        assert!(is_identifier("mod2"));
        assert!(!is_identifier("2mod"));
        assert!(!is_identifier("class"));
        assert!(!is_identifier("with"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("a-b"));
    }

    #[test]
    fn module_names_from_filenames() {
        assert_eq!(module_name_of("tests.py"), Some("tests"));
        assert_eq!(module_name_of("lambda.py"), None);
        assert_eq!(module_name_of("tests.txt"), None);
        assert_eq!(module_name_of("3rd.py"), None);
    }

    #[test]
    fn dotted_name_passes_through() {
        let target = interpret_argument("pkg.sub.tests").unwrap();
        assert_eq!(target.root, None);
        assert_eq!(target.name, "pkg.sub.tests");
        assert_eq!(search(&target), ["pkg.sub.tests"]);
    }

    #[test]
    fn garbage_argument_is_rejected() {
        assert!(interpret_argument("no/such/file.py").is_err());
        assert!(interpret_argument("not-a-module").is_err());
        assert!(interpret_argument("class.tests").is_err());
    }

    #[test]
    fn file_inside_a_package_resolves_upward() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg = tmp.path().join("pkg");
        fs::create_dir_all(pkg.join("sub")).unwrap();
        fs::write(pkg.join(PACKAGE_MARKER), "").unwrap();
        fs::write(pkg.join("sub").join(PACKAGE_MARKER), "").unwrap();
        fs::write(pkg.join("sub").join("tests.py"), "").unwrap();

        let argument = pkg.join("sub").join("tests.py");
        let target = interpret_argument(argument.to_str().unwrap()).unwrap();
        assert_eq!(target.name, "pkg.sub.tests");
        assert_eq!(
            target.root.unwrap().canonicalize().unwrap(),
            tmp.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn plain_directory_yields_its_modules() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("alpha.py"), "").unwrap();
        fs::write(tmp.path().join("beta.py"), "").unwrap();
        fs::write(tmp.path().join("notes.txt"), "").unwrap();
        fs::write(tmp.path().join("backup.py~"), "").unwrap();

        let target = interpret_argument(tmp.path().to_str().unwrap()).unwrap();
        assert_eq!(target.name, "");
        assert_eq!(search(&target), ["alpha", "beta"]);
    }

    #[test]
    fn package_directory_walks_recursively() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg = tmp.path().join("pkg");
        fs::create_dir_all(pkg.join("inner")).unwrap();
        fs::create_dir_all(pkg.join("stray")).unwrap();
        fs::write(pkg.join(PACKAGE_MARKER), "").unwrap();
        fs::write(pkg.join("tests.py"), "").unwrap();
        fs::write(pkg.join("inner").join(PACKAGE_MARKER), "").unwrap();
        fs::write(pkg.join("inner").join("more.py"), "").unwrap();
        // stray has no marker, so nothing under it is importable
        fs::write(pkg.join("stray").join("ignored.py"), "").unwrap();

        let target = interpret_argument(pkg.to_str().unwrap()).unwrap();
        assert_eq!(target.name, "pkg");
        assert_eq!(search(&target), ["pkg", "pkg.inner.more", "pkg.tests"]);
    }
}

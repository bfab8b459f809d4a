//! Resource document loading: YAML files and directories on the
//! controller machine.
//!
//! A document is a sequence of single-key mappings `{TypeName: body}`;
//! multiple YAML documents per file concatenate. Unknown type names and
//! unknown body fields are hard errors, as are duplicate `(kind, id)`
//! pairs across everything loaded. Directories contribute their `*.yaml`
//! files recursively in lexicographic path order.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::Deserialize as _;

use crate::error::ValidationError;
use crate::resources::Resource;
use crate::state::State;

fn io_error(path: &Path, source: std::io::Error) -> ValidationError {
    ValidationError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Collect `*.yaml` files under `dir`, recursively, sorted by full path.
fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), ValidationError> {
    let entries = std::fs::read_dir(dir).map_err(|e| io_error(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_error(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| io_error(&path, e))?;
        if file_type.is_dir() {
            collect_yaml_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "yaml") {
            out.push(path);
        }
    }
    Ok(())
}

/// Parse one file's documents into `state`.
fn load_file(state: &mut State, path: &Path) -> Result<()> {
    let text =
        std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;

    for document in serde_yaml::Deserializer::from_str(&text) {
        // An empty document (or an empty file) deserializes as None.
        let resources = Option::<Vec<Resource>>::deserialize(document)
            .map_err(|source| ValidationError::Yaml {
                file: path.display().to_string(),
                source,
            })?
            .unwrap_or_default();
        for resource in resources {
            resource
                .validate()
                .with_context(|| format!("in {}", path.display()))?;
            state
                .append(resource)
                .with_context(|| format!("in {}", path.display()))?;
        }
    }
    Ok(())
}

/// Load resource documents from files and directories into one state.
///
/// # Errors
///
/// I/O, parse, structural validation, or duplicate-id failures, each
/// carrying the offending file in its context.
pub fn load_paths(paths: &[PathBuf]) -> Result<State> {
    let mut state = State::new();
    for path in paths {
        let meta = std::fs::metadata(path).map_err(|e| io_error(path, e))?;
        if meta.is_dir() {
            let mut files = Vec::new();
            collect_yaml_files(path, &mut files)?;
            files.sort();
            for file in files {
                load_file(&mut state, &file)?;
            }
        } else {
            load_file(&mut state, path)?;
        }
    }
    Ok(state)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::resources::Kind;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    const SIMPLE: &str = "\
- APTPackage:
    package: vim
    version: \"9.1\"
    hold: true
- File:
    path: /etc/motd
    regular_file: \"welcome\\n\"
";

    #[test]
    fn loads_a_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "site.yaml", SIMPLE);

        let state = load_paths(&[file]).unwrap();
        assert_eq!(state.len(), 2);
        assert!(state.contains(Kind::AptPackage, "vim"));
        assert!(state.contains(Kind::File, "/etc/motd"));
    }

    #[test]
    fn concatenates_multiple_yaml_documents() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(
            dir.path(),
            "multi.yaml",
            "- File:\n    path: /etc/a\n---\n- File:\n    path: /etc/b\n",
        );

        let state = load_paths(&[file]).unwrap();
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn directory_loads_recursively_in_lexicographic_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.yaml", "- File:\n    path: /etc/b\n");
        write(dir.path(), "a/nested.yaml", "- File:\n    path: /etc/a\n");
        write(dir.path(), "ignored.txt", "not yaml");

        let state = load_paths(&[dir.path().to_path_buf()]).unwrap();
        let ids: Vec<String> = state.iter().map(Resource::id).collect();
        // a/nested.yaml sorts before b.yaml.
        assert_eq!(ids, vec!["/etc/a", "/etc/b"]);
    }

    #[test]
    fn duplicate_across_files_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "one.yaml", "- File:\n    path: /etc/hosts\n");
        write(dir.path(), "two.yaml", "- File:\n    path: /etc/hosts\n");

        let err = load_paths(&[dir.path().to_path_buf()]).unwrap_err();
        let text = format!("{err:#}");
        assert!(text.contains("duplicated resource"), "got: {text}");
        assert!(text.contains("two.yaml"), "names the file: {text}");
    }

    #[test]
    fn unknown_field_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(
            dir.path(),
            "bad.yaml",
            "- APTPackage:\n    package: vim\n    flavour: cosmic\n",
        );

        let err = load_paths(&[file]).unwrap_err();
        let text = format!("{err:#}");
        assert!(text.contains("bad.yaml"), "got: {text}");
    }

    #[test]
    fn structural_validation_runs_at_load_time() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "rel.yaml", "- File:\n    path: etc/relative\n");

        let err = load_paths(&[file]).unwrap_err();
        let text = format!("{err:#}");
        assert!(text.contains("absolute"), "got: {text}");
        assert!(text.contains("rel.yaml"), "got: {text}");
    }

    #[test]
    fn missing_path_is_an_io_error() {
        let err = load_paths(&[PathBuf::from("/definitely/missing.yaml")]).unwrap_err();
        assert!(format!("{err:#}").contains("missing.yaml"), "got: {err:#}");
    }
}

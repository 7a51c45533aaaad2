//! Task definition files.
//!
//! A task folder holds one TOML file per task. The task name defaults to the
//! file stem:
//!
//! ```toml
//! description = "Expose the schema over HTTP"
//! depends_on = ["schema"]
//! complexity = "medium"
//! scope = ["src/api.rs", "src/routes.rs"]
//! ```
//!
//! `keel.toml` in the same folder is the session configuration and is not a
//! task.

use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::CONFIG_FILE_NAME;
use crate::core::task::{Complexity, TaskId, TaskSpec};
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskFile {
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    complexity: Complexity,
    #[serde(default)]
    scope: BTreeSet<String>,
}

/// Parse one task definition.
///
/// # Errors
/// Returns an error if the TOML is malformed or the name is empty.
pub fn parse_task(contents: &str, default_name: &str) -> Result<TaskSpec> {
    let file: TaskFile = toml::from_str(contents)?;
    let name = file.name.unwrap_or_else(|| default_name.to_string());
    if name.trim().is_empty() {
        return Err(Error::InvalidInput("task name cannot be empty".to_string()));
    }
    Ok(TaskSpec {
        name: TaskId::from(name),
        description: file.description,
        depends_on: file.depends_on.into_iter().map(TaskId::from).collect(),
        complexity: file.complexity,
        scope: file.scope,
    })
}

/// Load every task definition in a folder, sorted by file name.
///
/// # Errors
/// Returns `InvalidInput` if the folder is missing or holds no definitions.
pub fn load_task_dir(dir: &Path) -> Result<Vec<TaskSpec>> {
    if !dir.is_dir() {
        return Err(Error::InvalidInput(format!(
            "task folder not found: {}",
            dir.display()
        )));
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
        .filter(|path| path.file_name().is_some_and(|name| name != CONFIG_FILE_NAME))
        .collect();
    paths.sort();

    let mut specs = Vec::with_capacity(paths.len());
    for path in paths {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let contents = fs::read_to_string(&path)?;
        let spec = parse_task(&contents, &stem).map_err(|e| {
            Error::InvalidInput(format!("{}: {}", path.display(), e))
        })?;
        debug!(task = %spec.name, path = %path.display(), "task definition loaded");
        specs.push(spec);
    }

    if specs.is_empty() {
        return Err(Error::InvalidInput(format!(
            "no task definitions in {}",
            dir.display()
        )));
    }
    Ok(specs)
}

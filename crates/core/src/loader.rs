//! Task-definition loader.
//!
//! Scans a directory recursively for `.yaml`/`.yml` files, one task
//! definition per file. String values may reference the environment via
//! `${NAME}`. Files that fail to parse are skipped with a warning so one bad
//! definition cannot take down the whole load; duplicate task ids are a hard
//! error because silently dropping one of them would be ambiguous.

use std::collections::HashSet;
use std::path::Path;

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::expand_env;
use crate::error::{ConductorError, Result};
use crate::task::TaskDefinition;

/// Load all task definitions under `dir` (recursive).
pub fn load_definitions(dir: &Path) -> Result<Vec<TaskDefinition>> {
    if !dir.exists() {
        return Err(ConductorError::Config(format!(
            "definitions directory does not exist: {}",
            dir.display()
        )));
    }

    let mut definitions = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "failed to read directory entry, skipping");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);
        if !is_yaml {
            continue;
        }

        let def = match load_definition_file(path) {
            Ok(def) => def,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unparseable task definition");
                continue;
            }
        };

        if !seen.insert(def.task_id.clone()) {
            return Err(ConductorError::Duplicate(format!(
                "task id '{}' defined more than once (second occurrence: {})",
                def.task_id,
                path.display()
            )));
        }
        definitions.push(def);
    }

    info!(path = %dir.display(), count = definitions.len(), "task definitions loaded");
    Ok(definitions)
}

/// Parse a single definition file, expanding env references and normalizing
/// the legacy cron shape.
pub fn load_definition_file(path: &Path) -> Result<TaskDefinition> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConductorError::Config(format!("read {}: {}", path.display(), e)))?;
    parse_definition(&raw)
}

/// Parse definition YAML text.
pub fn parse_definition(raw: &str) -> Result<TaskDefinition> {
    let expanded = expand_env(raw);
    let mut value: serde_yaml::Value = serde_yaml::from_str(&expanded)
        .map_err(|e| ConductorError::Validation(format!("invalid YAML: {}", e)))?;

    normalize_legacy_cron(&mut value);

    let def: TaskDefinition = serde_yaml::from_value(value)
        .map_err(|e| ConductorError::Validation(format!("invalid task definition: {}", e)))?;

    if def.task_id.trim().is_empty() {
        return Err(ConductorError::Validation(
            "task_id must be non-empty".to_string(),
        ));
    }
    Ok(def)
}

// ── Legacy cron shape ───────────────────────────────────────────────

/// Accept the decomposed cron-fields mapping and rewrite it into canonical
/// `cron_expressions`:
///
/// ```yaml
/// schedule:
///   type: cron
///   cron: { minute: "0", hour: "9" }
/// ```
///
/// becomes `cron_expressions: ["0 9 * * *"]`. Canonical input wins when both
/// shapes are present.
fn normalize_legacy_cron(value: &mut serde_yaml::Value) {
    let Some(schedule) = value.get_mut("schedule").and_then(|s| s.as_mapping_mut()) else {
        return;
    };

    let is_cron = schedule
        .get("type")
        .and_then(|t| t.as_str())
        .map(|t| t == "cron")
        .unwrap_or(false);
    if !is_cron {
        return;
    }

    let has_expressions = schedule
        .get("cron_expressions")
        .and_then(|e| e.as_sequence())
        .map(|s| !s.is_empty())
        .unwrap_or(false);

    let fields = schedule
        .remove("cron")
        .and_then(|f| f.as_mapping().cloned());

    if has_expressions {
        return;
    }

    if let Some(fields) = fields {
        let field = |name: &str| -> String {
            fields
                .get(name)
                .map(yaml_scalar_to_string)
                .unwrap_or_else(|| "*".to_string())
        };
        let expression = format!(
            "{} {} {} {} {}",
            field("minute"),
            field("hour"),
            field("day"),
            field("month"),
            field("day_of_week"),
        );
        warn!(expression = %expression, "legacy cron-fields schedule normalized to expression form");
        schedule.insert(
            serde_yaml::Value::from("cron_expressions"),
            serde_yaml::Value::Sequence(vec![serde_yaml::Value::from(expression)]),
        );
    }
}

/// Render a YAML scalar the way it was written (`0` and `"0"` both → "0").
fn yaml_scalar_to_string(v: &serde_yaml::Value) -> String {
    match v {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "*".to_string()),
    }
}

//! Offline workflow definition checks for the CLI.

use std::path::{Path, PathBuf};

use stepflow_core::engine::definition::load_workflow_file;

/// Validate definition files and print one line per file.
///
/// Directories are scanned recursively for `.yaml`/`.yml`, the same rule
/// the engine applies when loading a definitions directory at startup.
/// Returns an error when any file fails, so scripts can gate on the exit
/// code.
pub fn validate(path: &Path) -> anyhow::Result<()> {
    let mut files = Vec::new();
    if path.is_dir() {
        collect_definition_files(path, &mut files)?;
        files.sort();
    } else {
        files.push(path.to_path_buf());
    }

    if files.is_empty() {
        anyhow::bail!("no definition files under {}", path.display());
    }

    let mut failed = 0usize;
    for file in &files {
        match load_workflow_file(file) {
            Ok(def) => {
                println!(
                    "ok    {}  ({}, {} steps)",
                    file.display(),
                    def.name,
                    def.steps.len()
                );
            }
            Err(err) => {
                failed += 1;
                eprintln!("FAIL  {}  {err}", file.display());
            }
        }
    }

    println!("{} definition(s) checked, {} failed", files.len(), failed);
    if failed > 0 {
        anyhow::bail!("{failed} definition(s) failed validation");
    }
    Ok(())
}

fn collect_definition_files(dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_definition_files(&path, files)?;
        } else if matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml" | "yml")
        ) {
            files.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use stepflow_core::engine::definition::save_workflow_file;
    use stepflow_types::workflow::{StepDefinition, StepType, WorkflowDefinition};
    use uuid::Uuid;

    fn linear_definition(name: &str) -> WorkflowDefinition {
        let step = |id: &str, step_type: StepType, next: Option<&str>| StepDefinition {
            id: id.to_string(),
            step_type,
            function_id: (step_type == StepType::Simple).then(|| format!("fn-{id}")),
            sub_workflow_id: None,
            next_step_id: next.map(String::from),
            previous_step_id: None,
            decision_cases: vec![],
            switch_condition: None,
            stop_condition: None,
            retry_count: 0,
            input_template: HashMap::new(),
        };
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: name.to_string(),
            description: None,
            version: "1".to_string(),
            input_keys: vec![],
            restartable: true,
            timeout_seconds: None,
            steps: vec![
                step("start", StepType::Start, Some("work")),
                step("work", StepType::Simple, Some("end")),
                step("end", StepType::Terminate, None),
            ],
        }
    }

    #[test]
    fn validates_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linear.yaml");
        save_workflow_file(&path, &linear_definition("linear")).unwrap();

        validate(&path).unwrap();
    }

    #[test]
    fn fails_on_unparseable_definition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "name: broken").unwrap();

        let err = validate(&path).unwrap_err();
        assert!(err.to_string().contains("1 definition(s) failed"));
    }

    #[test]
    fn scans_directories_recursively_ignoring_other_files() {
        let dir = tempfile::tempdir().unwrap();
        save_workflow_file(
            &dir.path().join("nested").join("inner.yml"),
            &linear_definition("inner"),
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a workflow").unwrap();

        validate(dir.path()).unwrap();
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate(dir.path()).unwrap_err();
        assert!(err.to_string().contains("no definition files"));
    }
}

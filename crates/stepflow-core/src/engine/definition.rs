//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML (local files) or JSON (definition service) and the
//! canonical `WorkflowDefinition`, validates structural constraints (single
//! START, unique ids, valid successor references, per-type requirements,
//! acyclic successor chain), and provides discovery for definition files on
//! disk.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use stepflow_types::workflow::{StepType, WorkflowDefinition};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from definition parsing and validation.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A step references a step id that does not exist.
    #[error("unknown step reference: {0}")]
    UnknownStepReference(String),

    /// The successor chain contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
///
/// Runs `validate_definition` after deserialization, so the returned value
/// is guaranteed to be structurally valid.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumeric characters and hyphens
/// - At least one step exists, with exactly one START step
/// - All step IDs are unique
/// - `nextStepId` / `previousStepId` references point to existing step IDs
/// - Per-type requirements (functionId, switch cases, stop condition, ...)
/// - The successor chain is acyclic (DO_WHILE repeats on its own instance,
///   never through a backward successor edge)
/// - Timeout > 0 if set
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.name.is_empty() {
        return Err(DefinitionError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !def.name.chars().all(|c| c.is_alphanumeric() || c == '-') {
        return Err(DefinitionError::ValidationError(format!(
            "workflow name '{}' contains invalid characters (only alphanumeric and hyphens allowed)",
            def.name
        )));
    }

    if def.steps.is_empty() {
        return Err(DefinitionError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    // Unique step IDs
    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.is_empty() {
            return Err(DefinitionError::ValidationError(
                "step id must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(DefinitionError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    // Exactly one START step
    let start_count = def
        .steps
        .iter()
        .filter(|s| s.step_type == StepType::Start)
        .count();
    if start_count != 1 {
        return Err(DefinitionError::ValidationError(format!(
            "workflow must have exactly one START step, found {start_count}"
        )));
    }

    // Successor and predecessor references must be valid
    for step in &def.steps {
        if let Some(next) = &step.next_step_id {
            if !seen_ids.contains(next.as_str()) {
                return Err(DefinitionError::UnknownStepReference(format!(
                    "step '{}' points at unknown next step '{next}'",
                    step.id
                )));
            }
            if next == &step.id {
                return Err(DefinitionError::CycleDetected(format!(
                    "step '{}' points at itself",
                    step.id
                )));
            }
        }
        if let Some(prev) = &step.previous_step_id {
            if !seen_ids.contains(prev.as_str()) {
                return Err(DefinitionError::UnknownStepReference(format!(
                    "step '{}' points at unknown previous step '{prev}'",
                    step.id
                )));
            }
        }
    }

    // Per-type requirements
    for step in &def.steps {
        match step.step_type {
            StepType::Simple | StepType::DoWhile => {
                if step.function_id.is_none() {
                    return Err(DefinitionError::ValidationError(format!(
                        "{} step '{}' requires a functionId",
                        step.step_type, step.id
                    )));
                }
                if step.step_type == StepType::DoWhile && step.stop_condition.is_none() {
                    return Err(DefinitionError::ValidationError(format!(
                        "DO_WHILE step '{}' requires a stopCondition",
                        step.id
                    )));
                }
            }
            StepType::Switch => {
                if step.switch_condition.is_none() {
                    return Err(DefinitionError::ValidationError(format!(
                        "SWITCH step '{}' requires a switchCondition",
                        step.id
                    )));
                }
                if step.decision_cases.is_empty() {
                    return Err(DefinitionError::ValidationError(format!(
                        "SWITCH step '{}' requires at least one decision case",
                        step.id
                    )));
                }
                let mut case_names = HashSet::new();
                for case in &step.decision_cases {
                    if !case_names.insert(case.name.as_str()) {
                        return Err(DefinitionError::ValidationError(format!(
                            "SWITCH step '{}' has duplicate case '{}'",
                            step.id, case.name
                        )));
                    }
                    if case.function_id.is_none() && case.sub_workflow_id.is_none() {
                        return Err(DefinitionError::ValidationError(format!(
                            "case '{}' of SWITCH step '{}' needs a functionId or subWorkflowId",
                            case.name, step.id
                        )));
                    }
                }
            }
            StepType::SubWorkflow => {
                if step.sub_workflow_id.is_none() {
                    return Err(DefinitionError::ValidationError(format!(
                        "SUB_WORKFLOW step '{}' requires a subWorkflowId",
                        step.id
                    )));
                }
            }
            StepType::Terminate => {
                if step.next_step_id.is_some() {
                    return Err(DefinitionError::ValidationError(format!(
                        "TERMINATE step '{}' must not have a next step",
                        step.id
                    )));
                }
            }
            StepType::Start | StepType::Wait | StepType::Event | StepType::Human => {}
        }
    }

    validate_successor_chain(def)?;

    if let Some(t) = def.timeout_seconds {
        if t == 0 {
            return Err(DefinitionError::ValidationError(
                "timeout must be > 0".to_string(),
            ));
        }
    }

    Ok(())
}

/// Verify the `nextStepId` chain is acyclic via topological sort.
fn validate_successor_chain(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    let id_to_idx: HashMap<&str, usize> = def
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = def
        .steps
        .iter()
        .map(|s| graph.add_node(s.id.as_str()))
        .collect();

    for step in &def.steps {
        if let Some(next) = &step.next_step_id {
            let from = node_indices[id_to_idx[step.id.as_str()]];
            let to = node_indices[id_to_idx[next.as_str()]];
            graph.add_edge(from, to, ());
        }
    }

    toposort(&graph, None)
        .map(|_| ())
        .map_err(|cycle| {
            let node_id = graph[cycle.node_id()];
            DefinitionError::CycleDetected(format!("cycle detected involving step '{node_id}'"))
        })
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow definition to a YAML file.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all workflow YAML files under `base_dir`.
///
/// Scans for `.yaml` and `.yml` files recursively. Each file is parsed and
/// returned alongside its path. Files that fail to parse are skipped with a
/// warning so one bad file cannot take the whole directory down.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), DefinitionError> {
    let entries = std::fs::read_dir(dir)?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if let Some(ext) = path.extension() {
            if ext == "yaml" || ext == "yml" {
                match load_workflow_file(&path) {
                    Ok(def) => results.push((path, def)),
                    Err(_) => {
                        tracing::warn!(?path, "skipping unparseable workflow file");
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use stepflow_types::workflow::{DecisionCase, StepDefinition, StepType, WorkflowDefinition};
    use uuid::Uuid;

    /// Helper: build a minimal valid workflow definition.
    fn minimal_workflow(name: &str, steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: name.to_string(),
            description: None,
            version: "1".to_string(),
            input_keys: vec![],
            restartable: true,
            timeout_seconds: None,
            steps,
        }
    }

    /// Helper: build a bare step of the given type.
    fn step(id: &str, step_type: StepType, next: Option<&str>) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            step_type,
            function_id: matches!(step_type, StepType::Simple | StepType::DoWhile)
                .then(|| format!("fn-{id}")),
            sub_workflow_id: (step_type == StepType::SubWorkflow).then(Uuid::now_v7),
            next_step_id: next.map(String::from),
            previous_step_id: None,
            decision_cases: vec![],
            switch_condition: None,
            stop_condition: (step_type == StepType::DoWhile)
                .then(|| "[poll.outputData.done] == true".to_string()),
            retry_count: 0,
            input_template: HashMap::new(),
        }
    }

    fn linear_workflow() -> WorkflowDefinition {
        minimal_workflow(
            "linear",
            vec![
                step("start", StepType::Start, Some("work")),
                step("work", StepType::Simple, Some("end")),
                step("end", StepType::Terminate, None),
            ],
        )
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn valid_linear_workflow_passes() {
        validate_definition(&linear_workflow()).unwrap();
    }

    #[test]
    fn rejects_empty_and_bad_names() {
        let mut def = linear_workflow();
        def.name = String::new();
        assert!(validate_definition(&def)
            .unwrap_err()
            .to_string()
            .contains("name must not be empty"));

        def.name = "has spaces".to_string();
        assert!(validate_definition(&def)
            .unwrap_err()
            .to_string()
            .contains("invalid characters"));
    }

    #[test]
    fn rejects_zero_or_multiple_start_steps() {
        let def = minimal_workflow(
            "no-start",
            vec![step("work", StepType::Simple, None)],
        );
        assert!(validate_definition(&def)
            .unwrap_err()
            .to_string()
            .contains("exactly one START"));

        let def = minimal_workflow(
            "two-starts",
            vec![
                step("a", StepType::Start, Some("end")),
                step("b", StepType::Start, Some("end")),
                step("end", StepType::Terminate, None),
            ],
        );
        assert!(validate_definition(&def)
            .unwrap_err()
            .to_string()
            .contains("found 2"));
    }

    #[test]
    fn rejects_duplicate_step_ids() {
        let def = minimal_workflow(
            "dups",
            vec![
                step("start", StepType::Start, Some("work")),
                step("work", StepType::Simple, None),
                step("work", StepType::Simple, None),
            ],
        );
        assert!(validate_definition(&def)
            .unwrap_err()
            .to_string()
            .contains("duplicate step ID"));
    }

    #[test]
    fn rejects_unknown_successor() {
        let def = minimal_workflow(
            "dangling",
            vec![
                step("start", StepType::Start, Some("ghost")),
                step("end", StepType::Terminate, None),
            ],
        );
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownStepReference(_)));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn rejects_successor_cycles() {
        let mut a = step("a", StepType::Simple, Some("b"));
        a.previous_step_id = None;
        let b = step("b", StepType::Simple, Some("a"));
        let def = minimal_workflow(
            "loopy",
            vec![step("start", StepType::Start, Some("a")), a, b],
        );
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, DefinitionError::CycleDetected(_)));
    }

    #[test]
    fn rejects_self_loop() {
        let def = minimal_workflow(
            "selfie",
            vec![
                step("start", StepType::Start, Some("a")),
                step("a", StepType::Simple, Some("a")),
            ],
        );
        assert!(validate_definition(&def)
            .unwrap_err()
            .to_string()
            .contains("points at itself"));
    }

    #[test]
    fn simple_step_requires_function_id() {
        let mut work = step("work", StepType::Simple, None);
        work.function_id = None;
        let def = minimal_workflow(
            "no-fn",
            vec![step("start", StepType::Start, Some("work")), work],
        );
        assert!(validate_definition(&def)
            .unwrap_err()
            .to_string()
            .contains("requires a functionId"));
    }

    #[test]
    fn do_while_requires_stop_condition() {
        let mut poll = step("poll", StepType::DoWhile, None);
        poll.stop_condition = None;
        let def = minimal_workflow(
            "no-stop",
            vec![step("start", StepType::Start, Some("poll")), poll],
        );
        assert!(validate_definition(&def)
            .unwrap_err()
            .to_string()
            .contains("stopCondition"));
    }

    #[test]
    fn switch_requires_condition_and_distinct_cases() {
        let mut route = step("route", StepType::Switch, None);
        route.switch_condition = Some("[start.outputData.mode]".to_string());
        route.decision_cases = vec![
            DecisionCase {
                name: "express".to_string(),
                function_id: Some("fn-express".to_string()),
                sub_workflow_id: None,
                input_data: HashMap::new(),
                retry_count: 0,
            },
            DecisionCase {
                name: "express".to_string(),
                function_id: Some("fn-express-2".to_string()),
                sub_workflow_id: None,
                input_data: HashMap::new(),
                retry_count: 0,
            },
        ];
        let def = minimal_workflow(
            "switchy",
            vec![step("start", StepType::Start, Some("route")), route.clone()],
        );
        assert!(validate_definition(&def)
            .unwrap_err()
            .to_string()
            .contains("duplicate case"));

        route.decision_cases = vec![];
        let def = minimal_workflow(
            "caseless",
            vec![step("start", StepType::Start, Some("route")), route.clone()],
        );
        assert!(validate_definition(&def)
            .unwrap_err()
            .to_string()
            .contains("at least one decision case"));

        route.switch_condition = None;
        route.decision_cases = vec![DecisionCase {
            name: "only".to_string(),
            function_id: Some("fn-x".to_string()),
            sub_workflow_id: None,
            input_data: HashMap::new(),
            retry_count: 0,
        }];
        let def = minimal_workflow(
            "condless",
            vec![step("start", StepType::Start, Some("route")), route],
        );
        assert!(validate_definition(&def)
            .unwrap_err()
            .to_string()
            .contains("switchCondition"));
    }

    #[test]
    fn case_needs_a_target() {
        let mut route = step("route", StepType::Switch, None);
        route.switch_condition = Some("[start.outputData.mode]".to_string());
        route.decision_cases = vec![DecisionCase {
            name: "nowhere".to_string(),
            function_id: None,
            sub_workflow_id: None,
            input_data: HashMap::new(),
            retry_count: 0,
        }];
        let def = minimal_workflow(
            "targetless",
            vec![step("start", StepType::Start, Some("route")), route],
        );
        assert!(validate_definition(&def)
            .unwrap_err()
            .to_string()
            .contains("needs a functionId or subWorkflowId"));
    }

    #[test]
    fn terminate_must_be_final() {
        let mut end = step("end", StepType::Terminate, None);
        end.next_step_id = Some("start".to_string());
        let def = minimal_workflow(
            "overrun",
            vec![step("start", StepType::Start, Some("end")), end],
        );
        assert!(validate_definition(&def)
            .unwrap_err()
            .to_string()
            .contains("must not have a next step"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut def = linear_workflow();
        def.timeout_seconds = Some(0);
        assert!(validate_definition(&def)
            .unwrap_err()
            .to_string()
            .contains("timeout must be > 0"));
    }

    // -----------------------------------------------------------------------
    // YAML roundtrip and filesystem
    // -----------------------------------------------------------------------

    #[test]
    fn yaml_roundtrip_preserves_definition() {
        let def = linear_workflow();
        let yaml = serialize_workflow_yaml(&def).unwrap();
        let back = parse_workflow_yaml(&yaml).unwrap();
        assert_eq!(back.id, def.id);
        assert_eq!(back.steps.len(), 3);
        assert_eq!(back.steps[1].function_id.as_deref(), Some("fn-work"));
    }

    #[test]
    fn parse_rejects_invalid_yaml_and_invalid_workflows() {
        assert!(matches!(
            parse_workflow_yaml(": not yaml"),
            Err(DefinitionError::ParseError(_))
        ));

        let mut def = linear_workflow();
        def.steps.remove(0);
        let yaml = serialize_workflow_yaml(&def).unwrap();
        assert!(parse_workflow_yaml(&yaml).is_err());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows/linear.yaml");
        let def = linear_workflow();
        save_workflow_file(&path, &def).unwrap();

        let loaded = load_workflow_file(&path).unwrap();
        assert_eq!(loaded.id, def.id);
        assert_eq!(loaded.name, "linear");
    }

    #[test]
    fn discover_finds_nested_files_and_skips_bad_ones() {
        let dir = tempfile::tempdir().unwrap();
        save_workflow_file(&dir.path().join("a.yaml"), &linear_workflow()).unwrap();
        save_workflow_file(&dir.path().join("nested/b.yml"), &linear_workflow()).unwrap();
        std::fs::write(dir.path().join("broken.yaml"), ": not a workflow").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let found = discover_workflows(dir.path()).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn discover_missing_directory_is_empty() {
        let found = discover_workflows(Path::new("/nonexistent/flows")).unwrap();
        assert!(found.is_empty());
    }
}

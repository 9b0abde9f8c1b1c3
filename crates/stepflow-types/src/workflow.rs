//! Workflow definition types for Stepflow.
//!
//! Defines the static shape of a workflow: the graph of `StepDefinition`s an
//! instance walks at execution time. Definitions are authored and stored by
//! the platform's definition service; the engine treats them as immutable
//! once an instance references them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The static definition of a workflow.
///
/// A linked graph of steps starting at the single `START` step and normally
/// ending at a `TERMINATE` step. Immutable while any instance of it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned by the definition service.
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Definition version string (e.g. "1.0.0").
    pub version: String,
    /// Input keys that must be present in the start payload.
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// Whether a terminal instance of this workflow may be restarted.
    #[serde(default)]
    pub restartable: bool,
    /// Instance timeout in seconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// The step graph.
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Look up a step by its definition id.
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// The single `START` step, if the definition has one.
    pub fn start_step(&self) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.step_type == StepType::Start)
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// User-defined step ID (e.g. "fetch-orders"). Unique within a workflow.
    pub id: String,
    /// The control structure of this step.
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Registered function invoked by this step (SIMPLE, DO_WHILE, decision
    /// targets).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<String>,
    /// Referenced workflow definition for SUB_WORKFLOW steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_workflow_id: Option<Uuid>,
    /// Successor step id. Absent on TERMINATE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
    /// Predecessor step id. Absent on START.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_step_id: Option<String>,
    /// Branches of a SWITCH step, matched by evaluated label.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decision_cases: Vec<DecisionCase>,
    /// Expression yielding the branch label for SWITCH steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switch_condition: Option<String>,
    /// Expression ending a DO_WHILE loop once it evaluates true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_condition: Option<String>,
    /// Maximum automatic retries after a failure callback.
    #[serde(default)]
    pub retry_count: u32,
    /// Invocation input; values may embed `[step.outputData.path]` references.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub input_template: HashMap<String, serde_json::Value>,
}

/// The control structure of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    Start,
    Simple,
    Switch,
    DoWhile,
    SubWorkflow,
    Wait,
    Event,
    Human,
    Terminate,
}

impl StepType {
    /// Steps that wait for an external signal instead of being dispatched.
    pub fn is_signal_gated(self) -> bool {
        matches!(self, StepType::Wait | StepType::Event | StepType::Human)
    }

    /// The wire name of this step type.
    pub fn as_str(self) -> &'static str {
        match self {
            StepType::Start => "START",
            StepType::Simple => "SIMPLE",
            StepType::Switch => "SWITCH",
            StepType::DoWhile => "DO_WHILE",
            StepType::SubWorkflow => "SUB_WORKFLOW",
            StepType::Wait => "WAIT",
            StepType::Event => "EVENT",
            StepType::Human => "HUMAN",
            StepType::Terminate => "TERMINATE",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Decision Case
// ---------------------------------------------------------------------------

/// One branch of a SWITCH step.
///
/// The switch condition evaluates to a label; the case whose `name` equals
/// that label is dispatched on the switch step's own instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionCase {
    /// Label matched against the evaluated switch condition.
    pub name: String,
    /// Function invoked when this case is selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<String>,
    /// Sub-workflow started when this case is selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_workflow_id: Option<Uuid>,
    /// Input for the case target; may embed resolver references.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub input_data: HashMap<String, serde_json::Value>,
    /// Retry budget for the case target.
    #[serde(default)]
    pub retry_count: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Build a definition exercising every step type.
    fn sample_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "order-fulfilment".to_string(),
            description: Some("Validate, charge, and ship an order".to_string()),
            version: "1.0.0".to_string(),
            input_keys: vec!["orderId".to_string(), "customerId".to_string()],
            restartable: true,
            timeout_seconds: Some(600),
            steps: vec![
                StepDefinition {
                    id: "start".to_string(),
                    step_type: StepType::Start,
                    function_id: None,
                    sub_workflow_id: None,
                    next_step_id: Some("validate".to_string()),
                    previous_step_id: None,
                    decision_cases: vec![],
                    switch_condition: None,
                    stop_condition: None,
                    retry_count: 0,
                    input_template: HashMap::new(),
                },
                StepDefinition {
                    id: "validate".to_string(),
                    step_type: StepType::Simple,
                    function_id: Some("fn-validate-order".to_string()),
                    sub_workflow_id: None,
                    next_step_id: Some("route".to_string()),
                    previous_step_id: Some("start".to_string()),
                    decision_cases: vec![],
                    switch_condition: None,
                    stop_condition: None,
                    retry_count: 2,
                    input_template: HashMap::from([(
                        "orderId".to_string(),
                        json!("[start.outputData.orderId]"),
                    )]),
                },
                StepDefinition {
                    id: "route".to_string(),
                    step_type: StepType::Switch,
                    function_id: None,
                    sub_workflow_id: None,
                    next_step_id: Some("poll".to_string()),
                    previous_step_id: Some("validate".to_string()),
                    decision_cases: vec![
                        DecisionCase {
                            name: "express".to_string(),
                            function_id: Some("fn-express-ship".to_string()),
                            sub_workflow_id: None,
                            input_data: HashMap::new(),
                            retry_count: 1,
                        },
                        DecisionCase {
                            name: "standard".to_string(),
                            function_id: Some("fn-standard-ship".to_string()),
                            sub_workflow_id: None,
                            input_data: HashMap::new(),
                            retry_count: 1,
                        },
                    ],
                    switch_condition: Some("[validate.outputData.tier]".to_string()),
                    stop_condition: None,
                    retry_count: 0,
                    input_template: HashMap::new(),
                },
                StepDefinition {
                    id: "poll".to_string(),
                    step_type: StepType::DoWhile,
                    function_id: Some("fn-poll-carrier".to_string()),
                    sub_workflow_id: None,
                    next_step_id: Some("invoice".to_string()),
                    previous_step_id: Some("route".to_string()),
                    decision_cases: vec![],
                    switch_condition: None,
                    stop_condition: Some("[poll.outputData.delivered] == true".to_string()),
                    retry_count: 0,
                    input_template: HashMap::new(),
                },
                StepDefinition {
                    id: "invoice".to_string(),
                    step_type: StepType::SubWorkflow,
                    function_id: None,
                    sub_workflow_id: Some(Uuid::now_v7()),
                    next_step_id: Some("confirm".to_string()),
                    previous_step_id: Some("poll".to_string()),
                    decision_cases: vec![],
                    switch_condition: None,
                    stop_condition: None,
                    retry_count: 0,
                    input_template: HashMap::new(),
                },
                StepDefinition {
                    id: "confirm".to_string(),
                    step_type: StepType::Human,
                    function_id: None,
                    sub_workflow_id: None,
                    next_step_id: Some("end".to_string()),
                    previous_step_id: Some("invoice".to_string()),
                    decision_cases: vec![],
                    switch_condition: None,
                    stop_condition: None,
                    retry_count: 0,
                    input_template: HashMap::new(),
                },
                StepDefinition {
                    id: "end".to_string(),
                    step_type: StepType::Terminate,
                    function_id: None,
                    sub_workflow_id: None,
                    next_step_id: None,
                    previous_step_id: Some("confirm".to_string()),
                    decision_cases: vec![],
                    switch_condition: None,
                    stop_condition: None,
                    retry_count: 0,
                    input_template: HashMap::new(),
                },
            ],
        }
    }

    // -----------------------------------------------------------------------
    // Definition roundtrips
    // -----------------------------------------------------------------------

    #[test]
    fn test_definition_json_roundtrip() {
        let original = sample_definition();
        let json_str = serde_json::to_string_pretty(&original).expect("serialize to JSON");
        assert!(json_str.contains("\"DO_WHILE\""));
        assert!(json_str.contains("\"SUB_WORKFLOW\""));
        let parsed: WorkflowDefinition =
            serde_json::from_str(&json_str).expect("deserialize from JSON");
        assert_eq!(parsed.name, "order-fulfilment");
        assert_eq!(parsed.steps.len(), 7);
        assert_eq!(parsed.input_keys, vec!["orderId", "customerId"]);
        assert!(parsed.restartable);
    }

    #[test]
    fn test_definition_yaml_roundtrip() {
        let original = sample_definition();
        let yaml = serde_yaml_ng::to_string(&original).expect("serialize to YAML");
        assert!(yaml.contains("type: SWITCH"));
        assert!(yaml.contains("switch_condition"));
        let parsed: WorkflowDefinition =
            serde_yaml_ng::from_str(&yaml).expect("deserialize from YAML");
        assert_eq!(parsed.steps.len(), original.steps.len());
        assert_eq!(parsed.version, "1.0.0");
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    #[test]
    fn test_step_lookup() {
        let def = sample_definition();
        assert_eq!(
            def.step("validate").map(|s| s.step_type),
            Some(StepType::Simple)
        );
        assert!(def.step("missing").is_none());
    }

    #[test]
    fn test_start_step_lookup() {
        let def = sample_definition();
        let start = def.start_step().expect("has a START step");
        assert_eq!(start.id, "start");
        assert_eq!(start.next_step_id.as_deref(), Some("validate"));
    }

    // -----------------------------------------------------------------------
    // Step type wire format
    // -----------------------------------------------------------------------

    #[test]
    fn test_step_type_screaming_snake_case() {
        for (step_type, wire) in [
            (StepType::Start, "\"START\""),
            (StepType::Simple, "\"SIMPLE\""),
            (StepType::Switch, "\"SWITCH\""),
            (StepType::DoWhile, "\"DO_WHILE\""),
            (StepType::SubWorkflow, "\"SUB_WORKFLOW\""),
            (StepType::Wait, "\"WAIT\""),
            (StepType::Event, "\"EVENT\""),
            (StepType::Human, "\"HUMAN\""),
            (StepType::Terminate, "\"TERMINATE\""),
        ] {
            let json = serde_json::to_string(&step_type).unwrap();
            assert_eq!(json, wire);
            let parsed: StepType = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, step_type);
        }
    }

    #[test]
    fn test_signal_gated_types() {
        assert!(StepType::Wait.is_signal_gated());
        assert!(StepType::Event.is_signal_gated());
        assert!(StepType::Human.is_signal_gated());
        assert!(!StepType::Simple.is_signal_gated());
        assert!(!StepType::DoWhile.is_signal_gated());
    }

    // -----------------------------------------------------------------------
    // Defaults
    // -----------------------------------------------------------------------

    #[test]
    fn test_step_definition_minimal_yaml() {
        let yaml = r#"
id: only
type: SIMPLE
function_id: fn-a
"#;
        let step: StepDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(step.retry_count, 0);
        assert!(step.decision_cases.is_empty());
        assert!(step.input_template.is_empty());
        assert!(step.next_step_id.is_none());
    }

    #[test]
    fn test_decision_case_defaults() {
        let json = r#"{"name": "high", "function_id": "fn-priority"}"#;
        let case: DecisionCase = serde_json::from_str(json).unwrap();
        assert_eq!(case.name, "high");
        assert_eq!(case.retry_count, 0);
        assert!(case.input_data.is_empty());
        assert!(case.sub_workflow_id.is_none());
    }
}

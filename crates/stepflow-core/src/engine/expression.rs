//! Expression resolution for step input templates and conditions.
//!
//! Step definitions reference earlier step outputs with the bracket form
//! `[stepId.outputData.path.to.field]`. The same grammar feeds three
//! consumers: input template resolution before a dispatch, SWITCH condition
//! evaluation, and DO_WHILE stop conditions. Conditions additionally
//! support the binary operators `==`, `!=`, `<` and `>`.
//!
//! Resolution is pure: the runner snapshots the outputs of the instance's
//! steps into an [`ExpressionScope`] and evaluates against that snapshot.

use std::collections::HashMap;

use serde_json::Value;
use stepflow_types::execution::WorkflowStepInstance;
use thiserror::Error;

/// Marker segment that separates the step id from the output path.
const OUTPUT_MARKER: &str = "outputData";

/// Errors raised while resolving expressions.
///
/// These surface as step failures on the callback path and as
/// `PayloadNotValid` when hit while starting a workflow.
#[derive(Debug, Error, PartialEq)]
pub enum ExpressionError {
    /// The referenced step id does not exist in the scope.
    #[error("unknown step `{0}` in expression")]
    UnknownStep(String),

    /// The step exists but the path does not resolve in its output.
    #[error("path `{path}` not found in output of step `{step}`")]
    UnresolvedPath { step: String, path: String },

    /// Bracketed text carries the output marker but does not form a
    /// complete reference.
    #[error("malformed reference `[{0}]`")]
    MalformedReference(String),

    /// A condition was required to produce a boolean and did not.
    #[error("expression `{0}` did not evaluate to a boolean")]
    NotBoolean(String),

    /// `<` or `>` was applied to operands that are not both numeric.
    #[error("cannot compare `{lhs}` {op} `{rhs}` numerically")]
    InvalidComparison {
        lhs: String,
        op: String,
        rhs: String,
    },
}

/// A parsed `[step.outputData.path]` reference.
struct Reference<'a> {
    step: &'a str,
    path: Vec<&'a str>,
}

/// Snapshot of step outputs an expression can reference.
///
/// Keys are step definition ids. The START step's instance carries the
/// workflow input as its output, so `[start.outputData.x]` reaches the
/// initial parameters through the same grammar.
#[derive(Debug, Default, Clone)]
pub struct ExpressionScope {
    outputs: HashMap<String, Value>,
}

impl ExpressionScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a scope from an instance's step instances, taking every step
    /// that has produced output so far.
    pub fn from_steps(steps: &[WorkflowStepInstance]) -> Self {
        let mut scope = Self::new();
        for step in steps {
            if !step.output_data.is_empty() {
                scope.insert(&step.step_id, &step.output_data);
            }
        }
        scope
    }

    /// Add one step's output map to the scope.
    pub fn insert(&mut self, step_id: &str, output: &HashMap<String, Value>) {
        let object = Value::Object(
            output
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        self.outputs.insert(step_id.to_string(), object);
    }

    // -----------------------------------------------------------------------
    // Reference resolution
    // -----------------------------------------------------------------------

    /// Resolve a raw string that may contain bracket references.
    ///
    /// When the whole string is a single reference, the referenced value is
    /// returned with its JSON type intact. Otherwise references are
    /// substituted into the surrounding text and a string is returned.
    pub fn resolve_value(&self, raw: &str) -> Result<Value, ExpressionError> {
        let trimmed = raw.trim();
        if let Some(inner) = single_reference(trimmed) {
            if let Some(reference) = parse_reference(inner)? {
                return self.lookup(&reference);
            }
        }
        Ok(Value::String(self.resolve_string(raw)?))
    }

    /// Substitute every reference in `raw`, rendering each resolved value
    /// as text. Bracketed text without the output marker stays literal.
    pub fn resolve_string(&self, raw: &str) -> Result<String, ExpressionError> {
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(open) = rest.find('[') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find(']') {
                Some(close) => {
                    let inner = &after[..close];
                    match parse_reference(inner)? {
                        Some(reference) => {
                            let value = self.lookup(&reference)?;
                            out.push_str(&value_to_string(&value));
                        }
                        None => {
                            out.push('[');
                            out.push_str(inner);
                            out.push(']');
                        }
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    // Unclosed bracket: keep the remainder literally.
                    out.push_str(&rest[open..]);
                    return Ok(out);
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Resolve every string inside a step input template, recursing through
    /// nested objects and arrays. Non-string leaves pass through untouched.
    pub fn resolve_template(
        &self,
        template: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>, ExpressionError> {
        let mut resolved = HashMap::with_capacity(template.len());
        for (key, value) in template {
            resolved.insert(key.clone(), self.resolve_nested(value)?);
        }
        Ok(resolved)
    }

    fn resolve_nested(&self, value: &Value) -> Result<Value, ExpressionError> {
        match value {
            Value::String(s) => self.resolve_value(s),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.resolve_nested(item)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_nested(v)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    // -----------------------------------------------------------------------
    // Condition evaluation
    // -----------------------------------------------------------------------

    /// Evaluate a condition expression.
    ///
    /// With a binary operator present the result is a boolean; without one
    /// the expression resolves like a value.
    pub fn evaluate(&self, expr: &str) -> Result<Value, ExpressionError> {
        match split_condition(expr) {
            Some((lhs, op, rhs)) => {
                let left = self.operand(lhs)?;
                let right = self.operand(rhs)?;
                let result = match op {
                    "==" => values_equal(&left, &right),
                    "!=" => !values_equal(&left, &right),
                    ordering => {
                        let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
                            return Err(ExpressionError::InvalidComparison {
                                lhs: value_to_string(&left),
                                op: ordering.to_string(),
                                rhs: value_to_string(&right),
                            });
                        };
                        if ordering == "<" { l < r } else { l > r }
                    }
                };
                Ok(Value::Bool(result))
            }
            None => self.operand(expr),
        }
    }

    /// Evaluate a condition that must produce a boolean (DO_WHILE stop
    /// conditions). Accepts the strings `"true"` / `"false"` as workers
    /// commonly report flags as text.
    pub fn evaluate_bool(&self, expr: &str) -> Result<bool, ExpressionError> {
        match self.evaluate(expr)? {
            Value::Bool(b) => Ok(b),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
            _ => Err(ExpressionError::NotBoolean(expr.to_string())),
        }
    }

    /// Evaluate a SWITCH condition down to the case label it selects.
    pub fn evaluate_label(&self, expr: &str) -> Result<String, ExpressionError> {
        Ok(value_to_string(&self.evaluate(expr)?))
    }

    /// Resolve one side of a condition: a reference, a quoted string, a
    /// number, a boolean literal, or bare text.
    fn operand(&self, raw: &str) -> Result<Value, ExpressionError> {
        let trimmed = raw.trim();
        if let Some(inner) = single_reference(trimmed) {
            if let Some(reference) = parse_reference(inner)? {
                return self.lookup(&reference);
            }
        }
        if let Some(stripped) = strip_quotes(trimmed) {
            return Ok(Value::String(stripped.to_string()));
        }
        if trimmed.eq_ignore_ascii_case("true") {
            return Ok(Value::Bool(true));
        }
        if trimmed.eq_ignore_ascii_case("false") {
            return Ok(Value::Bool(false));
        }
        if let Ok(int) = trimmed.parse::<i64>() {
            return Ok(Value::Number(int.into()));
        }
        if let Ok(float) = trimmed.parse::<f64>() {
            if let Some(number) = serde_json::Number::from_f64(float) {
                return Ok(Value::Number(number));
            }
        }
        // Bare text may still embed references mid-string.
        Ok(Value::String(self.resolve_string(trimmed)?))
    }

    fn lookup(&self, reference: &Reference<'_>) -> Result<Value, ExpressionError> {
        let root = self
            .outputs
            .get(reference.step)
            .ok_or_else(|| ExpressionError::UnknownStep(reference.step.to_string()))?;
        let mut current = root;
        for segment in &reference.path {
            current = match current {
                Value::Object(map) => map.get(*segment),
                Value::Array(items) => segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|idx| items.get(idx)),
                _ => None,
            }
            .ok_or_else(|| ExpressionError::UnresolvedPath {
                step: reference.step.to_string(),
                path: reference.path.join("."),
            })?;
        }
        Ok(current.clone())
    }
}

// ---------------------------------------------------------------------------
// Grammar helpers
// ---------------------------------------------------------------------------

/// Return the bracket interior when the whole string is one bracket pair.
fn single_reference(raw: &str) -> Option<&str> {
    let inner = raw.strip_prefix('[')?.strip_suffix(']')?;
    // A second bracket means embedded references, not a single one.
    if inner.contains('[') || inner.contains(']') {
        return None;
    }
    Some(inner)
}

/// Parse bracket interior into a reference.
///
/// `Ok(None)` means the text has no output marker and stays literal;
/// `Err` means the marker is present but the shape is wrong.
fn parse_reference(inner: &str) -> Result<Option<Reference<'_>>, ExpressionError> {
    let segments: Vec<&str> = inner.split('.').collect();
    if segments.len() < 2 || segments[1] != OUTPUT_MARKER {
        return Ok(None);
    }
    if segments.len() < 3 || segments[0].is_empty() || segments[2..].iter().any(|s| s.is_empty()) {
        return Err(ExpressionError::MalformedReference(inner.to_string()));
    }
    Ok(Some(Reference {
        step: segments[0],
        path: segments[2..].to_vec(),
    }))
}

/// Find the first binary operator outside brackets and quotes.
fn split_condition(expr: &str) -> Option<(&str, &'static str, &str)> {
    let bytes = expr.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' => quote = Some(b),
                b'[' => depth += 1,
                b']' => depth = depth.saturating_sub(1),
                _ if depth == 0 => {
                    if b == b'=' && bytes.get(i + 1) == Some(&b'=') {
                        return Some((&expr[..i], "==", &expr[i + 2..]));
                    }
                    if b == b'!' && bytes.get(i + 1) == Some(&b'=') {
                        return Some((&expr[..i], "!=", &expr[i + 2..]));
                    }
                    if b == b'<' {
                        return Some((&expr[..i], "<", &expr[i + 1..]));
                    }
                    if b == b'>' {
                        return Some((&expr[..i], ">", &expr[i + 1..]));
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }
    None
}

fn strip_quotes(raw: &str) -> Option<&str> {
    for quote in ['\'', '"'] {
        if let Some(inner) = raw
            .strip_prefix(quote)
            .and_then(|r| r.strip_suffix(quote))
        {
            return Some(inner);
        }
    }
    None
}

/// Loose equality: numeric when both sides are numbers, otherwise compare
/// rendered text so `"5" == 5` and `"express" == express` both hold.
fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return l == r;
    }
    value_to_string(left) == value_to_string(right)
}

/// Render a JSON value the way it appears inside substituted strings.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

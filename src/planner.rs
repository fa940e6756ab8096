//! Plan Compiler
//!
//! Decomposes a free-text request into an ordered multi-step execution
//! plan by delegating to the planner model. The model's structured-output
//! channel is unreliable: it emits near-JSON with missing object wrappers
//! around array elements, truncated trailing content, and stray ellipses.
//! All repair heuristics live behind `repair_plan_json`, so everything
//! downstream only ever sees a valid plan or no plan.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::llm::PlannerModel;
use crate::tools::ToolDeclaration;

/// One element of a compiled plan
#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    /// 1-based, contiguous after normalization
    pub step_number: usize,
    /// Capability name, or None for a narrative-only step
    pub tool: Option<String>,
    /// Free-text description of the step
    pub action: String,
    pub parameters: Map<String, Value>,
}

/// Outcome of plan compilation.
///
/// Discarded after the request completes; no persistence beyond one
/// request's lifetime.
#[derive(Debug, Clone, PartialEq)]
pub enum MultiStepPlan {
    /// Handle as a single-step request. `fallback` marks that the planner
    /// produced output we could not use.
    Single { fallback: bool },
    Multi {
        steps: Vec<PlanStep>,
        reasoning: String,
    },
}

impl MultiStepPlan {
    pub fn is_multi_step(&self) -> bool {
        matches!(self, Self::Multi { .. })
    }
}

/// Single-tool selection for the direct dispatch path
#[derive(Debug, Clone)]
pub struct ToolChoice {
    pub tool: String,
    pub parameters: Map<String, Value>,
}

// Wire shapes; lenient on purpose, normalization fills the gaps.
#[derive(Debug, Deserialize)]
struct PlanJson {
    #[serde(default, alias = "isMultiStep", alias = "multi_step")]
    is_multi_step: bool,
    #[serde(default)]
    steps: Vec<StepJson>,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct StepJson {
    #[serde(default, alias = "stepNumber", alias = "step")]
    step_number: Option<usize>,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    parameters: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct ChoiceJson {
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    parameters: Option<Map<String, Value>>,
}

// Connectives that suggest a request implies more than one capability.
static MULTI_STEP_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(and then|then send|then make|then create|after that|also (send|create|make)|first .+ then|y luego|después|y también|también (envía|crea|haz))\b",
    )
    .unwrap()
});

/// Compiles multi-step plans and single-tool choices from user text
pub struct PlanCompiler {
    model: Arc<dyn PlannerModel>,
    max_steps: usize,
}

impl PlanCompiler {
    pub fn new(model: Arc<dyn PlannerModel>) -> Self {
        Self {
            model,
            max_steps: 8,
        }
    }

    /// Cheap gate that decides whether the decomposition model is consulted
    /// at all. A miss costs nothing: the request runs as single-step.
    pub fn looks_multi_step(text: &str) -> bool {
        MULTI_STEP_HINT.is_match(text)
    }

    /// Ask the model to decompose `request` into an ordered step list.
    ///
    /// Never fails the request: unusable planner output degrades to
    /// `Single { fallback: true }`.
    pub async fn plan(&self, request: &str, declarations: &[ToolDeclaration]) -> MultiStepPlan {
        let prompt = self.plan_prompt(request, declarations);

        let raw = match self.model.generate(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Planner model unavailable: {}", e);
                return MultiStepPlan::Single { fallback: true };
            }
        };

        self.compile(&raw)
    }

    /// Repair + parse + validate raw planner output
    pub fn compile(&self, raw: &str) -> MultiStepPlan {
        let repaired = match repair_plan_json(raw) {
            Some(text) => text,
            None => {
                debug!("Planner output unrecoverable, falling back to single-step");
                return MultiStepPlan::Single { fallback: true };
            }
        };

        let parsed: PlanJson = match serde_json::from_str(&repaired) {
            Ok(plan) => plan,
            Err(e) => {
                debug!("Repaired plan still unparseable: {}", e);
                return MultiStepPlan::Single { fallback: true };
            }
        };

        if !parsed.is_multi_step {
            return MultiStepPlan::Single { fallback: false };
        }

        let mut steps = normalize_steps(parsed.steps);
        steps.truncate(self.max_steps);

        // A one-element "plan" is just a single-step request.
        if steps.len() < 2 {
            return MultiStepPlan::Single { fallback: false };
        }

        MultiStepPlan::Multi {
            steps,
            reasoning: parsed.reasoning,
        }
    }

    /// Ask the model which single tool (if any) matches the request
    pub async fn choose_tool(
        &self,
        request: &str,
        declarations: &[ToolDeclaration],
    ) -> Option<ToolChoice> {
        let prompt = self.choice_prompt(request, declarations);
        let raw = self.model.generate(&prompt).await.ok()?;
        let repaired = repair_plan_json(&raw)?;
        let parsed: ChoiceJson = serde_json::from_str(&repaired).ok()?;

        parsed
            .tool
            .filter(|t| !t.is_empty() && t != "null")
            .map(|tool| ToolChoice {
                tool,
                parameters: parsed.parameters.unwrap_or_default(),
            })
    }

    fn plan_prompt(&self, request: &str, declarations: &[ToolDeclaration]) -> String {
        format!(
            r#"Decide whether this request needs multiple tools executed in order.

Available tools:
{}

Request: {}

Return a JSON object:
{{"isMultiStep": true/false, "reasoning": "...", "steps": [{{"stepNumber": 1, "tool": "tool_name or null", "action": "...", "parameters": {{}}}}]}}

Use at most {} steps. JSON only:"#,
            render_declarations(declarations),
            request,
            self.max_steps
        )
    }

    fn choice_prompt(&self, request: &str, declarations: &[ToolDeclaration]) -> String {
        format!(
            r#"Pick the single best tool for this request, or null for a plain conversational answer.

Available tools:
{}

Request: {}

Return a JSON object: {{"tool": "tool_name or null", "parameters": {{}}}}

JSON only:"#,
            render_declarations(declarations),
            request
        )
    }
}

fn render_declarations(declarations: &[ToolDeclaration]) -> String {
    declarations
        .iter()
        .map(|d| {
            let params = d
                .parameters
                .iter()
                .map(|(name, spec)| {
                    format!(
                        "{} ({}{})",
                        name,
                        spec.kind.as_str(),
                        if spec.required { ", required" } else { "" }
                    )
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("- {}: {} [{}]", d.name, d.description, params)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default missing fields: 1-based position, null tool, empty parameters
fn normalize_steps(steps: Vec<StepJson>) -> Vec<PlanStep> {
    steps
        .into_iter()
        .enumerate()
        .map(|(i, step)| PlanStep {
            step_number: step.step_number.unwrap_or(i + 1),
            tool: step.tool.filter(|t| !t.is_empty() && t != "null"),
            action: step.action.unwrap_or_default(),
            parameters: step.parameters.unwrap_or_default(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// JSON repair
// ---------------------------------------------------------------------------

/// Best-effort repair of near-JSON planner output.
///
/// Pure and idempotent on already-valid JSON. Returns None when no object
/// span exists at all; a Some result may still fail to parse (the caller
/// falls back to single-step in that case).
pub fn repair_plan_json(raw: &str) -> Option<String> {
    let unfenced = strip_code_fences(raw);
    let span = extract_object_span(&unfenced)?;
    let rewrapped = rewrap_flat_steps(&span);
    let cleaned = strip_artifacts(&rewrapped);
    Some(balance_closers(&cleaned))
}

/// Remove markdown code-fence wrappers, keeping the fenced body
fn strip_code_fences(raw: &str) -> String {
    if !raw.contains("```") {
        return raw.to_string();
    }

    let mut inside = false;
    let mut body = String::new();
    for line in raw.lines() {
        if line.trim_start().starts_with("```") {
            inside = !inside;
            continue;
        }
        if inside {
            body.push_str(line);
            body.push('\n');
        }
    }

    // Unclosed fence: everything after the opener is the body
    if body.trim().is_empty() {
        if let Some(pos) = raw.find("```") {
            let after = &raw[pos + 3..];
            let after = after.strip_prefix("json").unwrap_or(after);
            return after.trim_end_matches('`').to_string();
        }
        return raw.to_string();
    }

    body
}

/// Isolate the outermost `{...}` span. A truncated object (no matching
/// closing brace) yields the span to end of input; the balance stage
/// appends the missing closers.
fn extract_object_span(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for i in start..bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..=i].to_string());
                }
            }
            _ => {}
        }
    }

    Some(text[start..].to_string())
}

// Keys that open a new step object when the model emitted the step array
// as a flat key/value sequence.
const STEP_BOUNDARY_KEYS: &[&str] = &["stepNumber", "step_number", "step"];

/// Repair `"steps": ["stepNumber": 1, ..., "stepNumber": 2, ...]` into a
/// proper array of objects by injecting the missing object tokens at step
/// boundaries. Valid arrays pass through untouched.
fn rewrap_flat_steps(text: &str) -> String {
    static STEPS_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r#""steps"\s*:\s*\["#).unwrap());

    let m = match STEPS_OPEN.find(text) {
        Some(m) => m,
        None => return text.to_string(),
    };
    let array_start = m.end(); // index just past '['

    // Already well-formed (objects) or empty: nothing to do.
    match text[array_start..].trim_start().chars().next() {
        Some('{') | Some(']') | None => return text.to_string(),
        _ => {}
    }

    // Scan the array body up to its matching ']' (or end of input when
    // truncated), tracking boundary-key positions at array depth.
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut boundaries: Vec<usize> = Vec::new();
    let mut array_end: Option<usize> = None;

    let mut i = array_start;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                if depth == 0 {
                    if let Some(key_len) = boundary_key_at(&text[i..]) {
                        boundaries.push(i);
                        i += key_len;
                        continue;
                    }
                }
                in_string = true;
            }
            '{' | '[' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ']' => {
                if depth == 0 {
                    array_end = Some(i);
                    break;
                }
                depth -= 1;
            }
            _ => {}
        }
        i += 1;
    }

    if boundaries.is_empty() {
        return text.to_string();
    }

    let body_end = array_end.unwrap_or(bytes.len());
    let body = &text[array_start..body_end];

    // Split the body at each boundary key and wrap the chunks.
    let rel: Vec<usize> = boundaries.iter().map(|b| b - array_start).collect();
    let mut chunks: Vec<&str> = Vec::new();
    for (n, &start) in rel.iter().enumerate() {
        let end = rel.get(n + 1).copied().unwrap_or(body.len());
        chunks.push(body[start..end].trim_end_matches([' ', '\n', '\t', ',']));
    }

    let rebuilt = chunks
        .iter()
        .map(|c| format!("{{{}}}", c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut out = String::with_capacity(text.len() + chunks.len() * 2);
    out.push_str(&text[..array_start]);
    out.push_str(&rebuilt);
    match array_end {
        Some(end) => out.push_str(&text[end..]),
        None => {} // truncated array; balance stage appends the closers
    }
    out
}

/// Length of the quoted boundary key at the start of `s` (which begins with
/// a '"'), if the key is one of the step-boundary names followed by ':'
fn boundary_key_at(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    for key in STEP_BOUNDARY_KEYS {
        let quoted_len = key.len() + 2;
        if bytes.len() > quoted_len
            && &bytes[1..1 + key.len()] == key.as_bytes()
            && bytes[1 + key.len()] == b'"'
        {
            let mut j = quoted_len;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            if j < bytes.len() && bytes[j] == b':' {
                return Some(quoted_len);
            }
        }
    }
    None
}

/// Remove literal ellipsis artifacts outside strings, and the dangling
/// commas they leave behind (including a trailing comma at end of input)
fn strip_artifacts(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut pending_comma = false;

    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;

        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        // Ellipsis artifacts: "..." or the single-char variant
        if c == '.' && text[i..].starts_with("...") {
            i += 3;
            continue;
        }
        if c == '…' {
            i += '…'.len_utf8();
            continue;
        }

        if c == ',' {
            // Hold the comma until we know it is not dangling
            if pending_comma {
                // two commas in a row collapse to one
                i += 1;
                continue;
            }
            pending_comma = true;
            i += 1;
            continue;
        }

        if pending_comma && !c.is_whitespace() {
            if c != '}' && c != ']' {
                out.push(',');
            }
            pending_comma = false;
        } else if pending_comma && c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '"' {
            in_string = true;
        }
        out.push(c);
        i += 1;
    }

    // A held comma at end of input is dangling by definition.
    out
}

/// Append the closers for any unbalanced braces/brackets, innermost first
fn balance_closers(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for i in 0..bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    if stack.is_empty() {
        return text.trim_end().to_string();
    }

    let mut out = text.trim_end().to_string();
    // Drop a trailing comma left right at the truncation point
    while out.ends_with(',') {
        out.pop();
        while out.ends_with(char::is_whitespace) {
            out.pop();
        }
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::PlannerModel;
    use anyhow::Result;
    use async_trait::async_trait;

    struct CannedModel(String);

    #[async_trait]
    impl PlannerModel for CannedModel {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    fn compiler(canned: &str) -> PlanCompiler {
        PlanCompiler::new(Arc::new(CannedModel(canned.to_string())))
    }

    const VALID_PLAN: &str = r#"{"isMultiStep": true, "reasoning": "two deliverables",
        "steps": [
            {"stepNumber": 1, "tool": "create_image", "action": "draw a cat", "parameters": {"prompt": "a cat"}},
            {"stepNumber": 2, "tool": "create_poll", "action": "poll about cats", "parameters": {"question": "Cats?"}}
        ]}"#;

    #[test]
    fn test_repair_is_noop_on_valid_json() {
        let repaired = repair_plan_json(VALID_PLAN).unwrap();
        let a: Value = serde_json::from_str(VALID_PLAN).unwrap();
        let b: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(a, b);

        // Idempotence: repairing the repaired text parses identically.
        let again = repair_plan_json(&repaired).unwrap();
        let c: Value = serde_json::from_str(&again).unwrap();
        assert_eq!(b, c);
    }

    #[test]
    fn test_strip_code_fences() {
        let fenced = "```json\n{\"isMultiStep\": false}\n```";
        let repaired = repair_plan_json(fenced).unwrap();
        let v: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(v["isMultiStep"], Value::Bool(false));
    }

    #[test]
    fn test_extracts_object_from_chatter() {
        let raw = "Sure! Here is the plan: {\"isMultiStep\": false} Hope that helps.";
        let repaired = repair_plan_json(raw).unwrap();
        assert!(serde_json::from_str::<Value>(&repaired).is_ok());
    }

    #[test]
    fn test_rewrap_flat_step_array() {
        let raw = r#"{"isMultiStep": true, "steps": [
            "stepNumber": 1, "tool": "chat_summary", "action": "summarize",
            "stepNumber": 2, "tool": "create_poll", "action": "make poll"
        ], "reasoning": "pipeline"}"#;

        let repaired = repair_plan_json(raw).unwrap();
        let v: Value = serde_json::from_str(&repaired).unwrap();
        let steps = v["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0]["tool"], "chat_summary");
        assert_eq!(steps[1]["stepNumber"], 2);
    }

    #[test]
    fn test_truncated_with_ellipsis_balances_or_falls_back() {
        // Scenario: model output cut mid-array with a literal ellipsis
        let raw = r#"{"isMultiStep": true, "steps": [
            {"stepNumber": 1, "tool": "create_image", "action": "cat", "parameters": {}},
            ..."#;

        let compiler = compiler(raw);
        // Must not panic; either parses to a valid plan or falls back.
        let plan = compiler.compile(raw);
        match plan {
            MultiStepPlan::Single { .. } => {}
            MultiStepPlan::Multi { steps, .. } => assert!(!steps.is_empty()),
        }
    }

    #[test]
    fn test_truncated_plan_closes_and_parses() {
        let raw = r#"{"isMultiStep": true, "reasoning": "r", "steps": [
            {"stepNumber": 1, "tool": "web_search", "action": "find", "parameters": {}},
            {"stepNumber": 2, "tool": "create_image", "action": "draw", "parameters": {}"#;

        let repaired = repair_plan_json(raw).unwrap();
        let v: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(v["steps"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_dangling_comma_removed() {
        let raw = r#"{"isMultiStep": true, "steps": [{"tool": "a"}, {"tool": "b"},], }"#;
        let repaired = repair_plan_json(raw).unwrap();
        let v: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(v["steps"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_ellipsis_inside_string_untouched() {
        let raw = r#"{"isMultiStep": false, "reasoning": "wait... thinking"}"#;
        let repaired = repair_plan_json(raw).unwrap();
        let v: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(v["reasoning"], "wait... thinking");
    }

    #[test]
    fn test_unrecoverable_output() {
        assert!(repair_plan_json("no json here at all").is_none());
    }

    #[test]
    fn test_compile_valid_multi_step() {
        let plan = compiler(VALID_PLAN).compile(VALID_PLAN);
        match plan {
            MultiStepPlan::Multi { steps, reasoning } => {
                assert_eq!(steps.len(), 2);
                assert_eq!(steps[0].tool.as_deref(), Some("create_image"));
                assert_eq!(steps[1].step_number, 2);
                assert_eq!(reasoning, "two deliverables");
            }
            other => panic!("expected multi-step plan, got {:?}", other),
        }
    }

    #[test]
    fn test_single_element_plan_is_single_step() {
        let raw = r#"{"isMultiStep": true, "steps": [{"tool": "create_image", "action": "cat"}]}"#;
        let plan = compiler(raw).compile(raw);
        assert_eq!(plan, MultiStepPlan::Single { fallback: false });
    }

    #[test]
    fn test_garbage_falls_back_without_throwing() {
        let plan = compiler("???").compile("???");
        assert_eq!(plan, MultiStepPlan::Single { fallback: true });
    }

    #[test]
    fn test_normalization_round_trip() {
        // Explicit fields survive unchanged
        let steps = normalize_steps(vec![StepJson {
            step_number: Some(7),
            tool: Some("create_video".into()),
            action: Some("render".into()),
            parameters: Some(Map::from_iter([(
                "prompt".to_string(),
                Value::String("x".into()),
            )])),
        }]);
        assert_eq!(steps[0].step_number, 7);
        assert_eq!(steps[0].tool.as_deref(), Some("create_video"));
        assert_eq!(steps[0].parameters.len(), 1);

        // Missing step_number gets its 1-based position
        let steps = normalize_steps(vec![
            StepJson {
                step_number: None,
                tool: None,
                action: None,
                parameters: None,
            },
            StepJson {
                step_number: None,
                tool: Some("null".into()),
                action: None,
                parameters: None,
            },
        ]);
        assert_eq!(steps[0].step_number, 1);
        assert_eq!(steps[1].step_number, 2);
        assert_eq!(steps[0].tool, None);
        assert_eq!(steps[1].tool, None); // "null" string normalized away
        assert!(steps[0].parameters.is_empty());
    }

    #[test]
    fn test_multi_step_heuristic() {
        assert!(PlanCompiler::looks_multi_step(
            "create an image of a cat and then send a poll about cats"
        ));
        assert!(PlanCompiler::looks_multi_step(
            "haz un resumen y luego crea una encuesta"
        ));
        assert!(!PlanCompiler::looks_multi_step("draw me a cat"));
    }

    #[tokio::test]
    async fn test_plan_via_model() {
        let plan = compiler(VALID_PLAN).plan("make a cat image then a poll", &[]).await;
        assert!(plan.is_multi_step());
    }

    #[tokio::test]
    async fn test_choose_tool() {
        let raw = r#"{"tool": "create_image", "parameters": {"prompt": "a cat"}}"#;
        let choice = compiler(raw).choose_tool("draw a cat", &[]).await.unwrap();
        assert_eq!(choice.tool, "create_image");
        assert_eq!(choice.parameters["prompt"], "a cat");
    }

    #[tokio::test]
    async fn test_choose_tool_null() {
        let raw = r#"{"tool": null, "parameters": {}}"#;
        assert!(compiler(raw).choose_tool("hi", &[]).await.is_none());
    }
}

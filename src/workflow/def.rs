//! Document lowering: workflow root → workflows → step graphs.
//!
//! Step bodies are recognized by their key set; unknown keys and
//! conflicting combinations fail compilation deterministically. Embedded
//! `${…}` expressions parse eagerly here, so a document that compiles
//! has no latent syntax errors.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as Json;

use crate::expression::{trim_embedded, Expr, Template};
use crate::types::{Argument, Value};

use super::retry::RetrySpec;
use super::step::{
    AssignStep, CallStep, ExceptStep, Flow, ForStep, NextStep, ParallelStep, RaiseStep,
    ReturnStep, StepBody, StepGraph, StepName, StepsStep, SwitchStep, TryStep,
};
use super::{CompileError, Workflow, WorkflowRoot};

type Result<T> = std::result::Result<T, CompileError>;

/// Fields a step body may carry. Anything else is a compile error.
const EFFECTIVE_FIELDS: &[&str] = &[
    "call", "args", "try", "retry", "except", "for", "parallel", "assign", "steps", "raise",
    "switch", "result", "next", "return",
];

pub(crate) fn compile_root(doc: &Json) -> Result<Arc<WorkflowRoot>> {
    let Some(root) = doc.as_object() else {
        return Err(CompileError::Document(
            "top level must be a mapping of workflow names".to_string(),
        ));
    };

    let mut workflows = HashMap::new();
    for (name, def) in root {
        let workflow = compile_workflow(name, def).map_err(|e| e.at(name.clone()))?;
        workflows.insert(name.clone(), Arc::new(workflow));
    }

    let Some(main) = workflows.get("main") else {
        return Err(CompileError::invalid("main is required in workflow"));
    };
    if main.params.len() > 1 {
        return Err(CompileError::invalid(
            "main can have a single param only, multiple params are not supported",
        ));
    }

    Ok(WorkflowRoot::from_workflows(workflows))
}

fn compile_workflow(name: &str, def: &Json) -> Result<Workflow> {
    let Some(def) = def.as_object() else {
        return Err(CompileError::invalid("workflow must be a mapping"));
    };

    let params = match def.get("params") {
        None => Vec::new(),
        Some(params) => compile_params(params)?,
    };

    let Some(steps) = def.get("steps").and_then(Json::as_array) else {
        return Err(CompileError::invalid("steps: required"));
    };
    if steps.is_empty() {
        return Err(CompileError::invalid("empty steps"));
    }

    let graph = compile_graph(steps, Flow::End)?;
    Ok(Workflow {
        name: name.to_string(),
        params,
        graph,
    })
}

/// `params` entries are either `"name"` or `{name: default}`.
fn compile_params(doc: &Json) -> Result<Vec<Argument>> {
    let Some(entries) = doc.as_array() else {
        return Err(CompileError::invalid("params must be a list"));
    };
    let mut params = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        match entry {
            Json::String(name) => params.push(Argument::required(name)),
            Json::Object(map) if map.len() == 1 => {
                let (name, default) = map.iter().next().unwrap();
                params.push(Argument::with_default(name, Value::from_json(default)));
            }
            _ => {
                return Err(CompileError::invalid(format!(
                    "params[{i}]: invalid type"
                )))
            }
        }
    }
    Ok(params)
}

/// Compiles a list of named steps (`[{name: body}]`) into a graph. Each
/// step's fall-through successor is the next step in document order;
/// the last gets `last_default` (`end` at workflow level, `continue`
/// inside loop bodies).
fn compile_graph(steps: &[Json], last_default: Flow) -> Result<StepGraph> {
    let mut names = Vec::with_capacity(steps.len());
    let mut bodies = Vec::with_capacity(steps.len());
    for (i, entry) in steps.iter().enumerate() {
        let (name, body) = named_step(entry, i)?;
        if name == "end" {
            return Err(CompileError::invalid(format!(
                "cannot use the special step name {name:?}"
            )));
        }
        if names.contains(&name) {
            return Err(CompileError::invalid(format!(
                "{name}: duplicated step name in steps"
            )));
        }
        names.push(name);
        bodies.push(body);
    }

    let mut graph = HashMap::with_capacity(steps.len());
    for (i, body) in bodies.iter().enumerate() {
        let default = match names.get(i + 1) {
            Some(next) => Flow::Goto(next.clone()),
            None => last_default.clone(),
        };
        let compiled =
            compile_anonymous(body, default).map_err(|e| e.at(names[i].clone()))?;
        graph.insert(names[i].clone(), compiled);
    }

    Ok(StepGraph {
        entry: names[0].clone(),
        steps: graph,
    })
}

/// Compiles a list of named steps into an ordered fall-through
/// sequence (the `steps:` and `except.steps` shape).
fn compile_sequence(steps: &[Json]) -> Result<Vec<StepBody>> {
    let mut bodies = Vec::with_capacity(steps.len());
    for (i, entry) in steps.iter().enumerate() {
        let (name, body) = named_step(entry, i)?;
        bodies.push(compile_anonymous(&body, Flow::Inherit).map_err(|e| e.at(name))?);
    }
    Ok(bodies)
}

fn named_step(entry: &Json, index: usize) -> Result<(StepName, serde_json::Map<String, Json>)> {
    let Some(map) = entry.as_object() else {
        return Err(CompileError::invalid(format!(
            "steps[{index}]: unexpected workflow step structure"
        )));
    };
    if map.len() != 1 {
        return Err(CompileError::invalid(format!(
            "steps[{index}]: invalid workflow step structure"
        )));
    }
    let (name, body) = map.iter().next().unwrap();
    let Some(body) = body.as_object() else {
        return Err(CompileError::invalid(format!(
            "{name}: step body must be a mapping"
        )));
    };
    Ok((name.clone(), body.clone()))
}

/// Lowers one step body, picking the variant by key set.
fn compile_anonymous(
    def: &serde_json::Map<String, Json>,
    default_next: Flow,
) -> Result<StepBody> {
    let mut found: Vec<&str> = Vec::new();
    for field in EFFECTIVE_FIELDS {
        if def.contains_key(*field) {
            found.push(*field);
        }
    }
    if found.is_empty() {
        return Err(CompileError::invalid("no effective fields in the step"));
    }
    if found.len() != def.len() {
        return Err(CompileError::invalid(format!(
            "{} not effective fields in the step",
            def.len() - found.len()
        )));
    }

    let has = |field: &str| found.contains(&field);
    if has("next") && has("return") && has("raise") {
        return Err(CompileError::invalid("conflict next and return and raise"));
    }

    if has("call") {
        ensure_only(&found, &["call", "args", "result", "next"])?;
        compile_call(def, default_next)
    } else if has("switch") {
        ensure_only(&found, &["switch", "next"])?;
        compile_switch(def, default_next)
    } else if has("assign") {
        ensure_only(&found, &["assign", "next"])?;
        compile_assign(def, default_next)
    } else if has("try") {
        if !has("retry") && !has("except") {
            return Err(CompileError::invalid("try requires retry or except"));
        }
        ensure_only(&found, &["try", "retry", "except", "next"])?;
        compile_try(def, default_next)
    } else if has("for") {
        ensure_only(&found, &["for", "next"])?;
        compile_for(def, default_next).map(StepBody::For)
    } else if has("parallel") {
        ensure_only(&found, &["parallel", "next"])?;
        compile_parallel(def, default_next)
    } else if has("steps") {
        ensure_only(&found, &["steps", "next"])?;
        let steps = def["steps"]
            .as_array()
            .ok_or_else(|| CompileError::invalid("steps must be a list"))?;
        Ok(StepBody::Steps(StepsStep {
            steps: compile_sequence(steps)?,
            next: flow_of(def, default_next)?,
        }))
    } else if has("raise") {
        ensure_only(&found, &["raise"])?;
        compile_raise(&def["raise"])
    } else if has("return") {
        ensure_only(&found, &["return"])?;
        Ok(StepBody::Return(ReturnStep {
            value: Template::compile(&def["return"]).map_err(|e| CompileError::from(e).at("return"))?,
        }))
    } else if has("next") {
        ensure_only(&found, &["next"])?;
        let Flow::Goto(next) = flow_of(def, Flow::Inherit)? else {
            return Ok(StepBody::Return(ReturnStep {
                value: Template::Value(Value::Null),
            }));
        };
        Ok(StepBody::Next(NextStep { next }))
    } else {
        Err(CompileError::invalid("invalid step"))
    }
}

fn ensure_only(found: &[&str], allowed: &[&str]) -> Result<()> {
    for field in found {
        if !allowed.contains(field) {
            return Err(CompileError::invalid(format!(
                "conflicting field {field:?} in the step"
            )));
        }
    }
    Ok(())
}

/// Reads the explicit `next` field, falling back to the default.
fn flow_of(def: &serde_json::Map<String, Json>, default: Flow) -> Result<Flow> {
    match def.get("next") {
        None => Ok(default),
        Some(Json::String(name)) => Ok(Flow::parse(name)),
        Some(other) => Err(CompileError::invalid(format!("invalid next: {other}"))),
    }
}

fn compile_assign(def: &serde_json::Map<String, Json>, default_next: Flow) -> Result<StepBody> {
    let Some(entries) = def["assign"].as_array() else {
        return Err(CompileError::invalid("invalid assign: must be a list"));
    };
    let mut assigns = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let Some(pair) = entry.as_object() else {
            return Err(CompileError::invalid(format!(
                "invalid assign[{i}]: must be a single-entry mapping"
            )));
        };
        if pair.len() != 1 {
            return Err(CompileError::invalid(format!(
                "invalid assign[{i}]: too many entries"
            )));
        }
        let (target, value) = pair.iter().next().unwrap();
        let left = Expr::parse(target)
            .map_err(|e| CompileError::from(e).at(format!("invalid assign[{i}]")))?;
        if !left.can_reference() {
            return Err(CompileError::invalid(format!(
                "invalid assign[{i}]: cannot assign to {target:?}"
            )));
        }
        let right = Template::compile(value)
            .map_err(|e| CompileError::from(e).at(format!("invalid assign[{i}]")))?;
        assigns.push((left, right));
    }
    Ok(StepBody::Assign(AssignStep {
        assigns,
        next: flow_of(def, default_next)?,
    }))
}

fn compile_call(def: &serde_json::Map<String, Json>, default_next: Flow) -> Result<StepBody> {
    let Some(call) = def["call"].as_str() else {
        return Err(CompileError::invalid("invalid call: must be a string"));
    };
    let call = Expr::parse(call).map_err(|e| CompileError::from(e).at("invalid call"))?;
    if !call.can_reference() {
        return Err(CompileError::invalid(format!(
            "invalid call: not callable {:?}",
            call.source()
        )));
    }

    let args = match def.get("args") {
        None => None,
        Some(args @ (Json::Array(_) | Json::Object(_))) => {
            Some(Template::compile(args).map_err(|e| CompileError::from(e).at("invalid args"))?)
        }
        Some(other) => {
            return Err(CompileError::invalid(format!(
                "invalid args: must be a list or mapping, got {other}"
            )))
        }
    };

    let result = match def.get("result") {
        None => None,
        Some(Json::String(result)) => {
            let expr =
                Expr::parse(result).map_err(|e| CompileError::from(e).at("invalid result"))?;
            if !expr.is_symbol() {
                return Err(CompileError::invalid(format!(
                    "invalid result: must be a symbol but got {result:?}"
                )));
            }
            Some(expr)
        }
        Some(other) => {
            return Err(CompileError::invalid(format!("invalid result: {other}")))
        }
    };

    Ok(StepBody::Call(CallStep {
        call,
        args,
        result,
        next: flow_of(def, default_next)?,
    }))
}

fn compile_switch(def: &serde_json::Map<String, Json>, default_next: Flow) -> Result<StepBody> {
    let Some(entries) = def["switch"].as_array() else {
        return Err(CompileError::invalid("invalid switch: must be a list"));
    };

    let mut conditions = Vec::new();
    let mut default = None;
    for (i, entry) in entries.iter().enumerate() {
        let Some(entry) = entry.as_object() else {
            return Err(CompileError::invalid(format!(
                "invalid switch[{i}]: must be a mapping"
            )));
        };
        let mut body = entry.clone();
        let Some(condition) = body.remove("condition") else {
            return Err(CompileError::invalid(format!(
                "invalid switch[{i}]: condition is required"
            )));
        };
        let Some(condition) = condition.as_str() else {
            return Err(CompileError::invalid(format!(
                "invalid switch[{i}].condition: must be a string"
            )));
        };

        let step = compile_anonymous(&body, Flow::Inherit)
            .map_err(|e| e.at(format!("invalid switch[{i}]")))?;

        if let Some(expr) = trim_embedded(condition) {
            let condition = Expr::parse(expr)
                .map_err(|e| CompileError::from(e).at(format!("invalid switch[{i}].condition")))?;
            conditions.push((condition, Box::new(step)));
        } else if condition == "true" {
            // The literal default arm must close the switch.
            if i != entries.len() - 1 {
                return Err(CompileError::invalid(format!(
                    "invalid switch[{i}].condition: default step must be last"
                )));
            }
            default = Some(Box::new(step));
        } else {
            return Err(CompileError::invalid(format!(
                "invalid switch[{i}].condition: unknown format {condition:?}"
            )));
        }
    }

    Ok(StepBody::Switch(SwitchStep {
        conditions,
        default,
        next: flow_of(def, default_next)?,
    }))
}

fn compile_try(def: &serde_json::Map<String, Json>, default_next: Flow) -> Result<StepBody> {
    let Some(body) = def["try"].as_object() else {
        return Err(CompileError::invalid("invalid try: must be a mapping"));
    };
    let body = compile_anonymous(body, Flow::Inherit).map_err(|e| e.at("invalid try"))?;

    let retry = match def.get("retry") {
        None => None,
        Some(retry) => Some(RetrySpec::compile(retry).map_err(|e| e.at("invalid retry"))?),
    };

    let except = match def.get("except") {
        None => None,
        Some(except) => Some(compile_except(except).map_err(|e| e.at("invalid except"))?),
    };

    Ok(StepBody::Try(TryStep {
        body: Box::new(body),
        retry,
        except,
        next: flow_of(def, default_next)?,
    }))
}

fn compile_except(def: &Json) -> Result<ExceptStep> {
    let Some(def) = def.as_object() else {
        return Err(CompileError::invalid("must be a mapping"));
    };
    let Some(binding) = def.get("as").and_then(Json::as_str) else {
        return Err(CompileError::invalid("as: required"));
    };
    let expr = Expr::parse(binding).map_err(|e| CompileError::from(e).at("as"))?;
    if !expr.is_symbol() {
        return Err(CompileError::invalid(format!(
            "as: not a symbol {binding:?}"
        )));
    }
    let Some(steps) = def.get("steps").and_then(Json::as_array) else {
        return Err(CompileError::invalid("steps: required"));
    };
    Ok(ExceptStep {
        binding: binding.to_string(),
        steps: StepsStep {
            steps: compile_sequence(steps)?,
            next: Flow::Inherit,
        },
    })
}

fn compile_for(def: &serde_json::Map<String, Json>, default_next: Flow) -> Result<ForStep> {
    let Some(for_def) = def["for"].as_object() else {
        return Err(CompileError::invalid("invalid for: must be a mapping"));
    };
    compile_for_parts(for_def, flow_of(def, default_next)?)
}

fn compile_for_parts(
    for_def: &serde_json::Map<String, Json>,
    next: Flow,
) -> Result<ForStep> {
    let Some(value_name) = for_def.get("value").and_then(Json::as_str) else {
        return Err(CompileError::invalid("invalid for: value is required"));
    };
    let value_expr = Expr::parse(value_name)
        .map_err(|e| CompileError::from(e).at("invalid for.value"))?;
    if !value_expr.is_symbol() {
        return Err(CompileError::invalid(format!(
            "invalid for.value: not a symbol {value_name:?}"
        )));
    }

    let Some(iterable) = for_def.get("in") else {
        return Err(CompileError::invalid("invalid for: in is required"));
    };
    let iterable =
        Template::compile(iterable).map_err(|e| CompileError::from(e).at("invalid for.in"))?;

    let Some(steps) = for_def.get("steps").and_then(Json::as_array) else {
        return Err(CompileError::invalid("invalid for: steps is required"));
    };
    if steps.is_empty() {
        return Err(CompileError::invalid("invalid for: empty steps"));
    }
    // Loop bodies fall through to the next iteration.
    let body = compile_graph(steps, Flow::Goto("continue".to_string()))
        .map_err(|e| e.at("invalid for.steps"))?;

    Ok(ForStep {
        value_name: value_name.to_string(),
        iterable,
        body,
        next,
    })
}

fn compile_parallel(def: &serde_json::Map<String, Json>, default_next: Flow) -> Result<StepBody> {
    let Some(parallel) = def["parallel"].as_object() else {
        return Err(CompileError::invalid("invalid parallel: must be a mapping"));
    };

    for key in parallel.keys() {
        if !matches!(
            key.as_str(),
            "for" | "branches" | "shared" | "exception_policy" | "concurrency_limit"
        ) {
            return Err(CompileError::invalid(format!(
                "invalid parallel: unknown field {key:?}"
            )));
        }
    }

    if parallel.contains_key("branches") {
        if parallel.contains_key("for") {
            return Err(CompileError::invalid(
                "invalid parallel: for and branches conflict",
            ));
        }
        return Err(CompileError::invalid(
            "parallel branches are not implemented",
        ));
    }

    if let Some(policy) = parallel.get("exception_policy") {
        if policy.as_str() != Some("continueAll") {
            return Err(CompileError::invalid(format!(
                "invalid parallel.exception_policy: only \"continueAll\" is supported, got {policy}"
            )));
        }
    }

    let shared = match parallel.get("shared") {
        None => Vec::new(),
        Some(shared) => {
            let Some(entries) = shared.as_array() else {
                return Err(CompileError::invalid("invalid parallel.shared: must be a list"));
            };
            let mut roots = Vec::with_capacity(entries.len());
            for (i, entry) in entries.iter().enumerate() {
                let Some(name) = entry.as_str() else {
                    return Err(CompileError::invalid(format!(
                        "invalid parallel.shared[{i}]: must be a string"
                    )));
                };
                let expr = Expr::parse(name).map_err(|e| {
                    CompileError::from(e).at(format!("invalid parallel.shared[{i}]"))
                })?;
                if !expr.is_symbol() {
                    return Err(CompileError::invalid(format!(
                        "invalid parallel.shared[{i}]: must be a variable name, got {name:?}"
                    )));
                }
                roots.push(name.to_string());
            }
            roots
        }
    };

    let Some(for_def) = parallel.get("for").and_then(Json::as_object) else {
        return Err(CompileError::invalid(
            "invalid parallel: for is required",
        ));
    };
    let for_step = compile_for_parts(for_def, Flow::Inherit)
        .map_err(|e| e.at("invalid parallel"))?;

    Ok(StepBody::Parallel(ParallelStep {
        shared,
        for_step,
        next: flow_of(def, default_next)?,
    }))
}

fn compile_raise(doc: &Json) -> Result<StepBody> {
    let payload = match doc {
        Json::String(s) => {
            Template::compile_string(s).map_err(|e| CompileError::from(e).at("invalid raise"))?
        }
        Json::Object(_) => {
            Template::compile(doc).map_err(|e| CompileError::from(e).at("invalid raise"))?
        }
        _ => {
            return Err(CompileError::invalid(
                "invalid raise: must be a string or map",
            ))
        }
    };
    Ok(StepBody::Raise(RaiseStep { payload }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(yaml: &str) -> Result<Arc<WorkflowRoot>> {
        let doc: Json = serde_yaml::from_str(yaml).expect("yaml");
        compile_root(&doc)
    }

    #[test]
    fn main_is_required() {
        let err = compile("other: {steps: [{s: {return: 1}}]}").unwrap_err();
        assert!(err.to_string().contains("main is required"));
    }

    #[test]
    fn main_accepts_at_most_one_param() {
        let err = compile("main: {params: [a, b], steps: [{s: {return: 1}}]}").unwrap_err();
        assert!(err.to_string().contains("single param"));
    }

    #[test]
    fn duplicate_step_names_fail() {
        let err =
            compile("main: {steps: [{s: {return: 1}}, {s: {return: 2}}]}").unwrap_err();
        assert!(err.to_string().contains("duplicated"));
    }

    #[test]
    fn end_is_a_reserved_step_name() {
        let err = compile("main: {steps: [{end: {return: 1}}]}").unwrap_err();
        assert!(err.to_string().contains("special step name"));
    }

    #[test]
    fn unknown_fields_fail() {
        let err = compile("main: {steps: [{s: {bogus: 1}}]}").unwrap_err();
        assert!(err.to_string().contains("no effective fields"));
        let err = compile("main: {steps: [{s: {return: 1, bogus: 1}}]}").unwrap_err();
        assert!(err.to_string().contains("not effective fields"));
    }

    #[test]
    fn try_requires_a_handler_or_policy() {
        let err = compile(
            "main: {steps: [{s: {try: {assign: [{x: 1}]}}}]}",
        )
        .unwrap_err();
        assert!(err.to_string().contains("try requires retry or except"));
    }

    #[test]
    fn parallel_branches_fail_explicitly() {
        let err = compile(
            "main: {steps: [{s: {parallel: {branches: []}}}]}",
        )
        .unwrap_err();
        assert!(err.to_string().contains("not implemented"));
    }

    #[test]
    fn parallel_rejects_other_exception_policies() {
        let err = compile(
            "main: {steps: [{s: {parallel: {exception_policy: stopAll, for: {value: v, in: [], steps: [{a: {assign: [{x: 1}]}}]}}}}]}",
        )
        .unwrap_err();
        assert!(err.to_string().contains("continueAll"));
    }

    #[test]
    fn switch_default_must_be_last() {
        let err = compile(
            r#"
main:
  steps:
    - s:
        switch:
          - condition: "true"
            return: 1
          - condition: "${x > 0}"
            return: 2
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("default step must be last"));
    }

    #[test]
    fn switch_conditions_must_be_expressions() {
        let err = compile(
            r#"
main:
  steps:
    - s:
        switch:
          - condition: "yes"
            return: 1
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown format"));
    }

    #[test]
    fn assign_targets_must_be_lvalues() {
        let err = compile("main: {steps: [{s: {assign: [{\"a + 1\": 2}]}}]}").unwrap_err();
        assert!(err.to_string().contains("cannot assign"));
    }

    #[test]
    fn call_results_must_be_symbols() {
        let err = compile(
            "main: {steps: [{s: {call: sys.now, result: \"a.b\"}}]}",
        )
        .unwrap_err();
        assert!(err.to_string().contains("must be a symbol"));
    }

    #[test]
    fn raise_rejects_non_payload_types() {
        let err = compile("main: {steps: [{s: {raise: 5}}]}").unwrap_err();
        assert!(err.to_string().contains("string or map"));
    }

    #[test]
    fn a_valid_document_compiles() {
        let root = compile(
            r#"
main:
  params: [input]
  steps:
    - init:
        assign:
          - counter: 0
          - doubled: "${input * 2}"
    - maybe:
        switch:
          - condition: "${doubled > 4}"
            next: done
    - bump:
        assign:
          - counter: "${counter + 1}"
    - done:
        return: "${counter}"
helper:
  params: [x, {y: 10}]
  steps:
    - out:
        return: "${x + y}"
"#,
        )
        .expect("compile");
        assert!(root.workflow("main").is_some());
        assert_eq!(root.workflow("helper").unwrap().params.len(), 2);
        assert_eq!(
            root.workflow("helper").unwrap().params[1].default,
            Some(Value::Int(10))
        );
    }

    #[test]
    fn bad_expressions_fail_at_compile_time() {
        let err = compile("main: {steps: [{s: {return: \"${1 +}\"}}]}").unwrap_err();
        assert!(err.to_string().contains("invalid"));
    }
}

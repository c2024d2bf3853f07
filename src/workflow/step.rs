//! Step variants and the interpreter loop.
//!
//! A workflow (or a `for` body) is a graph of named steps. Executing a
//! step yields a value and a flow directive: fall through to the baked-in
//! successor, jump to a named step, or end the invocation. Jumps that
//! leave the current graph bubble to the caller, which is how `break`
//! and `continue` reach the loop driver.

use std::collections::HashMap;

use crate::expression::{Evaluator, Expr, Template};
use crate::types::{Exception, Result, RuntimeError, Value};

use super::parallel;
use super::retry::RetrySpec;

pub(crate) type StepName = String;

/// Where execution goes after a step.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Flow {
    /// The step did not pick a successor; the enclosing construct's
    /// default applies.
    Inherit,
    /// The invocation (or loop body) is done.
    End,
    /// Jump to a named step.
    Goto(StepName),
}

impl Flow {
    /// Parses a `next` field: `end` is terminal, anything else jumps.
    pub fn parse(name: &str) -> Flow {
        if name == "end" {
            Flow::End
        } else {
            Flow::Goto(name.to_string())
        }
    }

    fn or_default(self, default: &Flow) -> Flow {
        match self {
            Flow::Inherit => default.clone(),
            other => other,
        }
    }
}

/// How a step graph finished.
#[derive(Debug, PartialEq)]
pub(crate) enum Exit {
    /// Terminal `end` (or a `return`).
    End,
    /// A jump that names no step in this graph; `break`/`continue` from
    /// loop bodies arrive this way.
    Jump(StepName),
}

/// A named step graph: entry point plus lookup by name.
#[derive(Debug)]
pub(crate) struct StepGraph {
    pub entry: StepName,
    pub steps: HashMap<StepName, StepBody>,
}

impl StepGraph {
    /// Runs from the entry step until the graph ends or a jump leaves
    /// it. Errors wrap the failing step's name.
    pub fn run(&self, evaluator: &Evaluator) -> Result<(Value, Exit)> {
        let mut current = &self.entry;
        loop {
            let step = self
                .steps
                .get(current)
                .ok_or_else(|| RuntimeError::host(format!("{current}: not found")))?;
            tracing::debug!(step = %current, "executing step");
            let (ret, flow) = step
                .execute(evaluator)
                .map_err(|e| e.context(current.clone()))?;
            match flow {
                Flow::End => return Ok((ret, Exit::End)),
                Flow::Inherit => {
                    return Err(RuntimeError::host(format!(
                        "{current}: next step is not defined"
                    )))
                }
                Flow::Goto(name) => {
                    if self.steps.contains_key(&name) {
                        current = self.steps.get_key_value(&name).unwrap().0;
                    } else {
                        return Ok((ret, Exit::Jump(name)));
                    }
                }
            }
        }
    }
}

/// One step body, compiled.
#[derive(Debug)]
pub(crate) enum StepBody {
    Assign(AssignStep),
    Call(CallStep),
    Switch(SwitchStep),
    Try(TryStep),
    For(ForStep),
    Parallel(ParallelStep),
    Steps(StepsStep),
    Raise(RaiseStep),
    Return(ReturnStep),
    Next(NextStep),
}

impl StepBody {
    pub fn execute(&self, evaluator: &Evaluator) -> Result<(Value, Flow)> {
        match self {
            StepBody::Assign(step) => step.execute(evaluator),
            StepBody::Call(step) => step.execute(evaluator),
            StepBody::Switch(step) => step.execute(evaluator),
            StepBody::Try(step) => step.execute(evaluator),
            StepBody::For(step) => step.execute(evaluator),
            StepBody::Parallel(step) => step.execute(evaluator),
            StepBody::Steps(step) => step.execute(evaluator),
            StepBody::Raise(step) => step.execute(evaluator),
            StepBody::Return(step) => step.execute(evaluator),
            StepBody::Next(step) => Ok((Value::Null, Flow::Goto(step.next.clone()))),
        }
    }
}

/// `assign`: ordered l-value / r-value pairs.
#[derive(Debug)]
pub(crate) struct AssignStep {
    pub assigns: Vec<(Expr, Template)>,
    pub next: Flow,
}

impl AssignStep {
    fn execute(&self, evaluator: &Evaluator) -> Result<(Value, Flow)> {
        // One lock acquisition covers the whole block.
        let lefts: Vec<&Expr> = self.assigns.iter().map(|(left, _)| left).collect();
        let _locks = evaluator.lock_shared_if_needed(&lefts)?;

        for (i, (left, right)) in self.assigns.iter().enumerate() {
            let run = || -> Result<()> {
                let reference = evaluator.resolve_reference(left)?;
                let variable = reference.resolve_variable(&evaluator.symbol_table)?;
                let value = evaluator.evaluate_template(right)?;
                variable.set(&evaluator.symbol_table, value)
            };
            run().map_err(|e| e.context(format!("invalid assign[{i}]")))?;
        }
        Ok((Value::Null, self.next.clone()))
    }
}

/// `call`: callee, positional or named args, optional result l-value.
#[derive(Debug)]
pub(crate) struct CallStep {
    pub call: Expr,
    pub args: Option<Template>,
    pub result: Option<Expr>,
    pub next: Flow,
}

impl CallStep {
    fn execute(&self, evaluator: &Evaluator) -> Result<(Value, Flow)> {
        let reference = evaluator
            .resolve_reference(&self.call)
            .map_err(|e| e.context(format!("unknown call {:?}", self.call.source())))?;
        let resolved = reference
            .resolve_value(&evaluator.symbol_table)
            .map_err(|e| e.context(format!("unknown call {:?}", self.call.source())))?;
        let Some(function) = resolved.value.as_function().cloned() else {
            return Err(RuntimeError::host(format!(
                "not a callable function: {}",
                self.call.source()
            )));
        };

        let args = match &self.args {
            None => Vec::new(),
            Some(template) => {
                let value = evaluator
                    .evaluate_template(template)
                    .map_err(|e| e.context("invalid args"))?;
                match value {
                    Value::List(items) => items.read().clone(),
                    // Named arguments splat in declared parameter order;
                    // unnamed positions stay omitted.
                    Value::Map(map) => {
                        let map = map.read();
                        function
                            .arg_names()
                            .iter()
                            .map(|name| map.get(*name).cloned().unwrap_or(Value::Omitted))
                            .collect()
                    }
                    other => {
                        return Err(RuntimeError::host(format!(
                            "invalid args type: {}",
                            other.kind()
                        )))
                    }
                }
            }
        };

        tracing::debug!(call = %self.call.source(), "calling");
        let ret = function
            .call(args)
            .map_err(|e| e.context(format!("call {:?}", self.call.source())))?;

        if let Some(result) = &self.result {
            let _locks = evaluator.lock_shared_if_needed(&[result])?;
            let reference = evaluator
                .resolve_reference(result)
                .map_err(|e| e.context(format!("unknown result {:?}", result.source())))?;
            let variable = reference.resolve_variable(&evaluator.symbol_table)?;
            variable.set(&evaluator.symbol_table, ret.clone())?;
        }

        Ok((ret, self.next.clone()))
    }
}

/// `switch`: ordered conditions plus an optional trailing default.
#[derive(Debug)]
pub(crate) struct SwitchStep {
    pub conditions: Vec<(Expr, Box<StepBody>)>,
    pub default: Option<Box<StepBody>>,
    pub next: Flow,
}

impl SwitchStep {
    fn execute(&self, evaluator: &Evaluator) -> Result<(Value, Flow)> {
        for (i, (condition, body)) in self.conditions.iter().enumerate() {
            let value = evaluator
                .evaluate_value(condition)
                .map_err(|e| e.context(format!("invalid condition[{i}]")))?;
            if matches!(value, Value::Bool(true)) {
                let (ret, flow) = body.execute(evaluator)?;
                return Ok((ret, flow.or_default(&self.next)));
            }
        }
        if let Some(default) = &self.default {
            let (ret, flow) = default.execute(evaluator)?;
            return Ok((ret, flow.or_default(&self.next)));
        }
        Ok((Value::Null, self.next.clone()))
    }
}

/// `try` with optional retry policy and optional `except` handler.
#[derive(Debug)]
pub(crate) struct TryStep {
    pub body: Box<StepBody>,
    pub retry: Option<RetrySpec>,
    pub except: Option<ExceptStep>,
    pub next: Flow,
}

#[derive(Debug)]
pub(crate) struct ExceptStep {
    pub binding: String,
    pub steps: StepsStep,
}

impl TryStep {
    fn execute(&self, evaluator: &Evaluator) -> Result<(Value, Flow)> {
        let mut policy = match &self.retry {
            None => None,
            Some(spec) => Some(
                spec.evaluate(evaluator)
                    .map_err(|e| e.context("retry"))?
                    .into_state(),
            ),
        };

        loop {
            match self.body.execute(evaluator) {
                Ok((ret, flow)) => return Ok((ret, flow.or_default(&self.next))),
                Err(error) => {
                    let Some(exception) = error.exception().cloned() else {
                        return Err(error);
                    };

                    if let Some(state) = policy.as_mut() {
                        if state.should_retry(evaluator, &exception)? {
                            state.backoff();
                            continue;
                        }
                    }

                    let Some(except) = &self.except else {
                        return Err(error);
                    };
                    let (ret, flow) = except.execute(evaluator, &exception)?;
                    return Ok((ret, flow.or_default(&self.next)));
                }
            }
        }
    }
}

impl ExceptStep {
    fn execute(&self, evaluator: &Evaluator, exception: &Exception) -> Result<(Value, Flow)> {
        // The handler sees the exception payload in its own scope; outer
        // bindings of the same name stay untouched.
        let table = evaluator.symbol_table.shallow_clone();
        table.define(&self.binding, exception.payload())?;
        let scoped = Evaluator::new(table);
        self.steps.execute(&scoped)
    }
}

/// Serial `for` over a list.
#[derive(Debug)]
pub(crate) struct ForStep {
    pub value_name: String,
    pub iterable: Template,
    pub body: StepGraph,
    pub next: Flow,
}

impl ForStep {
    /// Resolves the iterable to a snapshot of list elements.
    pub(crate) fn items(&self, evaluator: &Evaluator) -> Result<Vec<Value>> {
        let value = evaluator
            .evaluate_template(&self.iterable)
            .map_err(|e| e.context("invalid for..in"))?;
        let Some(items) = value.as_list() else {
            return Err(Exception::type_error(format!(
                "for..in value is not a list: got {}",
                value.kind()
            ))
            .into());
        };
        let snapshot = items.read().clone();
        Ok(snapshot)
    }

    fn execute(&self, evaluator: &Evaluator) -> Result<(Value, Flow)> {
        let items = self.items(evaluator)?;
        let table = evaluator.symbol_table.child();
        let scoped = Evaluator::new(table);

        for item in items {
            scoped.symbol_table.define(&self.value_name, item)?;
            let (ret, exit) = self.body.run(&scoped)?;
            match exit {
                // A `return` inside the loop ends the whole invocation.
                Exit::End => return Ok((ret, Flow::End)),
                Exit::Jump(name) if name == "break" => break,
                Exit::Jump(name) if name == "continue" => continue,
                Exit::Jump(name) => {
                    return Err(RuntimeError::host(format!("{name}: not found")))
                }
            }
        }
        Ok((Value::Null, self.next.clone()))
    }
}

/// `parallel` with a `for` body and explicit shared variables.
#[derive(Debug)]
pub(crate) struct ParallelStep {
    pub shared: Vec<String>,
    pub for_step: ForStep,
    pub next: Flow,
}

impl ParallelStep {
    fn execute(&self, evaluator: &Evaluator) -> Result<(Value, Flow)> {
        parallel::execute(self, evaluator)?;
        Ok((Value::Null, self.next.clone()))
    }
}

/// `steps`: ordered sub-steps with fall-through.
#[derive(Debug)]
pub(crate) struct StepsStep {
    pub steps: Vec<StepBody>,
    pub next: Flow,
}

impl StepsStep {
    fn execute(&self, evaluator: &Evaluator) -> Result<(Value, Flow)> {
        for (i, step) in self.steps.iter().enumerate() {
            let (ret, flow) = step
                .execute(evaluator)
                .map_err(|e| e.context(format!("invalid steps[{i}]")))?;
            if flow != Flow::Inherit {
                return Ok((ret, flow));
            }
        }
        Ok((Value::Null, self.next.clone()))
    }
}

/// `raise`: evaluate the payload and raise it as an exception.
#[derive(Debug)]
pub(crate) struct RaiseStep {
    pub payload: Template,
}

impl RaiseStep {
    fn execute(&self, evaluator: &Evaluator) -> Result<(Value, Flow)> {
        let value = evaluator
            .evaluate_template(&self.payload)
            .map_err(|e| e.context("invalid raise"))?;
        match value {
            Value::String(message) => Err(Exception::String(message).into()),
            Value::Map(map) => Err(Exception::Map(map).into()),
            other => Err(Exception::type_error(format!(
                "raise value must be a string or map: got {}",
                other.kind()
            ))
            .into()),
        }
    }
}

/// `return`: evaluate and end.
#[derive(Debug)]
pub(crate) struct ReturnStep {
    pub value: Template,
}

impl ReturnStep {
    fn execute(&self, evaluator: &Evaluator) -> Result<(Value, Flow)> {
        let ret = evaluator
            .evaluate_template(&self.value)
            .map_err(|e| e.context("invalid return"))?;
        Ok((ret, Flow::End))
    }
}

/// Bare `next`: an unconditional jump.
#[derive(Debug)]
pub(crate) struct NextStep {
    pub next: StepName,
}

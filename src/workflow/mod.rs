//! Workflow documents: compilation into an immutable step program and
//! the interpreter that runs it.

/// Document lowering into the internal program.
pub(crate) mod def;
/// Parallel-for execution engine.
pub(crate) mod parallel;
/// Retry policy compilation and evaluation.
pub(crate) mod retry;
/// Step variants and the interpreter loop.
pub(crate) mod step;

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Weak};

use thiserror::Error;

use crate::expression::{Evaluator, ParseError};
use crate::stdlib;
use crate::types::{
    Argument, ErrorTag, Exception, Function, Result as ExecResult, RuntimeError, SymbolTable,
    Value,
};
use step::{Exit, StepGraph};

/// Maximum depth of nested sub-workflow invocations per thread.
const MAX_CALL_DEPTH: usize = 64;

/// Errors surfaced while reading or compiling a workflow document.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The document could not be read or deserialized at all.
    #[error("invalid workflow document: {0}")]
    Document(String),

    /// A structural rule was violated.
    #[error("{0}")]
    Invalid(String),

    /// An embedded expression failed to parse.
    #[error(transparent)]
    Expression(#[from] ParseError),

    /// Location wrapper; contexts accumulate outermost first.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<CompileError>,
    },
}

impl CompileError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        CompileError::Invalid(message.into())
    }

    pub(crate) fn at(self, context: impl Into<String>) -> Self {
        CompileError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// One compiled workflow.
#[derive(Debug)]
pub struct Workflow {
    pub name: String,
    pub params: Vec<Argument>,
    pub(crate) graph: StepGraph,
}

impl Workflow {
    /// Runs the workflow against an invocation table whose leaf scope
    /// holds (or will receive) the parameters.
    pub(crate) fn execute(&self, table: SymbolTable) -> ExecResult<Value> {
        for param in &self.params {
            if table.contains(&param.name) {
                continue;
            }
            if let Some(default) = &param.default {
                table.define(&param.name, default.clone())?;
                continue;
            }
            if param.optional {
                continue;
            }
            return Err(RuntimeError::host(format!(
                "missing param: {}",
                param.name
            )));
        }

        tracing::debug!(workflow = %self.name, "starting workflow");
        let evaluator = Evaluator::new(table);
        match self.graph.run(&evaluator)? {
            (ret, Exit::End) => Ok(ret),
            (_, Exit::Jump(name)) => Err(RuntimeError::host(format!("{name}: not found"))),
        }
    }
}

/// A compiled workflow-root document: every workflow by name, with the
/// required `main` entry point.
#[derive(Debug)]
pub struct WorkflowRoot {
    workflows: HashMap<String, Arc<Workflow>>,
}

impl WorkflowRoot {
    /// Parses a YAML document.
    pub fn parse_yaml(reader: impl Read) -> Result<Arc<Self>, CompileError> {
        let doc: serde_json::Value = serde_yaml::from_reader(reader)
            .map_err(|e| CompileError::Document(e.to_string()))?;
        Self::compile(&doc)
    }

    /// Parses a JSON document.
    pub fn parse_json(reader: impl Read) -> Result<Arc<Self>, CompileError> {
        let doc: serde_json::Value = serde_json::from_reader(reader)
            .map_err(|e| CompileError::Document(e.to_string()))?;
        Self::compile(&doc)
    }

    /// Compiles a decoded document tree.
    pub fn compile(doc: &serde_json::Value) -> Result<Arc<Self>, CompileError> {
        def::compile_root(doc)
    }

    pub(crate) fn from_workflows(workflows: HashMap<String, Arc<Workflow>>) -> Arc<Self> {
        Arc::new(Self { workflows })
    }

    pub fn workflow(&self, name: &str) -> Option<&Arc<Workflow>> {
        self.workflows.get(name)
    }

    /// Executes `main` with the given argument value.
    pub fn execute(self: &Arc<Self>, args: Value) -> ExecResult<Value> {
        let main = self
            .workflows
            .get("main")
            .ok_or_else(|| RuntimeError::host("main workflow is not defined"))?
            .clone();

        let table = self.invocation_table();
        if let Some(param) = main.params.first() {
            table.define(&param.name, args)?;
        }
        main.execute(table)
    }

    /// Base table for one invocation: the shared standard library plus a
    /// frame of callable sub-workflows, topped with a fresh parameter
    /// scope.
    fn invocation_table(self: &Arc<Self>) -> SymbolTable {
        let mut functions = HashMap::new();
        for (name, workflow) in &self.workflows {
            if name == "main" {
                continue;
            }
            functions.insert(
                name.clone(),
                Value::function(sub_workflow_function(workflow.clone(), Arc::downgrade(self))),
            );
        }
        stdlib::default_symbol_table()
            .with_frame(functions)
            .child()
    }
}

thread_local! {
    static CALL_DEPTH: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> ExecResult<Self> {
        let depth = CALL_DEPTH.with(|d| {
            let depth = d.get() + 1;
            d.set(depth);
            depth
        });
        if depth > MAX_CALL_DEPTH {
            CALL_DEPTH.with(|d| d.set(d.get() - 1));
            return Err(Exception::tagged(
                ErrorTag::RecursionError,
                format!("sub-workflow call depth exceeded {MAX_CALL_DEPTH}"),
            )
            .into());
        }
        Ok(DepthGuard)
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CALL_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Wraps a workflow as a callable value. Each call builds a fresh
/// invocation table from the program root.
fn sub_workflow_function(workflow: Arc<Workflow>, root: Weak<WorkflowRoot>) -> Function {
    let name = workflow.name.clone();
    let params = workflow.params.clone();
    Function::raw(name, params, move |args| {
        let _depth = DepthGuard::enter()?;
        let Some(root) = root.upgrade() else {
            return Err(RuntimeError::host(
                "workflow program was dropped while a call was in flight",
            ));
        };
        tracing::debug!(workflow = %workflow.name, "sub-workflow call");
        let table = root.invocation_table();
        for (param, value) in workflow.params.iter().zip(args) {
            table.define(&param.name, value)?;
        }
        workflow.execute(table)
    })
}

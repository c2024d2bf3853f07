//! Parallel-for execution.
//!
//! One OS thread per element. Before spawning, every symbol visible to
//! the step is recorded in the inherited-variables map (shared or not),
//! and each shared root is replaced in the table by a lock-cell handle.
//! Branches run against child tables over one shared snapshot; writes to
//! shared roots go through the evaluator's lock/swap discipline, writes
//! to other visible roots are rejected, and fresh branch-local symbols
//! stay private. The parent joins every branch and surfaces the first
//! error in iteration order.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use crate::expression::Evaluator;
use crate::types::{
    ErrorTag, Exception, InheritedVariables, Result, RuntimeError, SharedVariable, Value,
    INTERNAL_INHERITED_VARIABLES_SYMBOL,
};

use super::step::{Exit, ParallelStep};

pub(crate) fn execute(step: &ParallelStep, evaluator: &Evaluator) -> Result<()> {
    if evaluator
        .symbol_table
        .get(INTERNAL_INHERITED_VARIABLES_SYMBOL)
        .is_some()
    {
        return Err(Exception::tagged(
            ErrorTag::ParallelNestingError,
            "parallel steps cannot nest inside a parallel branch",
        )
        .into());
    }

    let items = step.for_step.items(evaluator)?;

    // Record every visible symbol, then promote the declared shared
    // roots to lock cells.
    let mut shared_map: HashMap<String, bool> = evaluator
        .symbol_table
        .keys()
        .into_iter()
        .map(|key| (key, false))
        .collect();
    let mut cells = Vec::with_capacity(step.shared.len());
    for root in &step.shared {
        let Some(current) = evaluator.symbol_table.get(root) else {
            return Err(RuntimeError::host(format!(
                "unknown shared variable: {root}"
            )));
        };
        shared_map.insert(root.clone(), true);
        let cell = Arc::new(SharedVariable::new(current));
        evaluator
            .symbol_table
            .set(root, Value::Shared(cell.clone()))?;
        cells.push((root.clone(), cell));
    }
    let inherited = Arc::new(InheritedVariables { shared: shared_map });

    let base_table = evaluator.symbol_table.shallow_clone();
    let mut first_error: Option<RuntimeError> = None;

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(items.len());
        for item in items {
            let base_table = &base_table;
            let inherited = &inherited;
            let for_step = &step.for_step;
            handles.push(scope.spawn(move || -> Result<()> {
                let table = base_table.child();
                table.define(&for_step.value_name, item)?;
                table.define(
                    INTERNAL_INHERITED_VARIABLES_SYMBOL,
                    Value::Inherited(inherited.clone()),
                )?;
                let branch = Evaluator::new(table);
                match for_step.body.run(&branch)? {
                    // The body graph's fall-through successor is
                    // `continue`; that is normal branch completion.
                    (_, Exit::Jump(name)) if name == "continue" => Ok(()),
                    (_, Exit::End) => Err(RuntimeError::host(
                        "cannot return from a parallel branch",
                    )),
                    (_, Exit::Jump(name)) if name == "break" => Err(RuntimeError::host(
                        "break cannot cross a parallel branch",
                    )),
                    (_, Exit::Jump(name)) => {
                        Err(RuntimeError::host(format!("{name}: not found")))
                    }
                }
            }));
        }

        // continueAll: every branch runs to completion; the first error
        // in iteration order wins.
        for (index, handle) in handles.into_iter().enumerate() {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(RuntimeError::host("parallel branch panicked")));
            if let Err(error) = result {
                if first_error.is_none() {
                    first_error = Some(error.context(format!("branch[{index}]")));
                }
            }
        }
    });

    // Unwrap the lock cells so later serial code sees plain values.
    for (root, cell) in cells {
        evaluator.symbol_table.set(&root, cell.snapshot())?;
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

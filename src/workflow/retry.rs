//! Retry policies for `try` steps.
//!
//! A policy is either a literal map in the document or an expression
//! that evaluates to such a map (e.g. the bundled HTTP retry policies).
//! The predicate is itself an expression resolving to a function; it is
//! called with the exception's public payload before each re-attempt.

use std::thread;
use std::time::Duration;

use crate::expression::{is_embedded_expr, trim_embedded, Evaluator, Expr};
use crate::types::{Exception, Result, RuntimeError, Value};

use super::CompileError;

/// Compile-time retry specification.
#[derive(Debug)]
pub(crate) enum RetrySpec {
    /// A literal policy from the document.
    Policy(CompiledRetryPolicy),
    /// An expression evaluated when the `try` step starts.
    Expr(Expr),
}

#[derive(Clone)]
#[derive(Debug)]
pub(crate) struct CompiledRetryPolicy {
    pub predicate: Expr,
    pub max_retries: i64,
    pub backoff: Backoff,
}

#[derive(Clone, Copy)]
#[derive(Debug)]
pub(crate) struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 1.25,
        }
    }
}

const DEFAULT_MAX_RETRIES: i64 = 5;

impl RetrySpec {
    /// Compiles the document form: a policy map, or an embedded
    /// expression string.
    pub fn compile(doc: &serde_json::Value) -> std::result::Result<Self, CompileError> {
        match doc {
            serde_json::Value::Object(map) => {
                Ok(RetrySpec::Policy(CompiledRetryPolicy::from_parts(
                    map.get("predicate").and_then(|v| v.as_str()),
                    map.get("max_retries").and_then(|v| v.as_i64()),
                    map.get("backoff").and_then(|v| v.as_object()).map(|b| {
                        (
                            b.get("initial_delay").and_then(|v| v.as_f64()),
                            b.get("max_delay").and_then(|v| v.as_f64()),
                            b.get("multiplier").and_then(|v| v.as_f64()),
                        )
                    }),
                )?))
            }
            serde_json::Value::String(s) if is_embedded_expr(s) => {
                let expr = Expr::parse(trim_embedded(s).unwrap())?;
                Ok(RetrySpec::Expr(expr))
            }
            _ => Err(CompileError::invalid(
                "retry must be a policy map or an expression",
            )),
        }
    }

    /// Resolves to a concrete policy at the start of a `try` step.
    pub fn evaluate(&self, evaluator: &Evaluator) -> Result<CompiledRetryPolicy> {
        match self {
            RetrySpec::Policy(policy) => Ok(policy.clone()),
            RetrySpec::Expr(expr) => {
                let value = evaluator.evaluate_value(expr)?;
                CompiledRetryPolicy::from_value(&value)
            }
        }
    }
}

impl CompiledRetryPolicy {
    fn from_parts(
        predicate: Option<&str>,
        max_retries: Option<i64>,
        backoff: Option<(Option<f64>, Option<f64>, Option<f64>)>,
    ) -> std::result::Result<Self, CompileError> {
        let Some(predicate) = predicate else {
            return Err(CompileError::invalid("predicate: required"));
        };
        let Some(inner) = trim_embedded(predicate) else {
            return Err(CompileError::invalid("predicate: not an expression"));
        };
        let predicate = Expr::parse(inner)?;
        if !predicate.can_reference() {
            return Err(CompileError::invalid(format!(
                "predicate: cannot reference {inner:?}"
            )));
        }

        let backoff = match backoff {
            None => Backoff::default(),
            Some((initial_delay, max_delay, multiplier)) => {
                let defaults = Backoff::default();
                Backoff {
                    initial_delay: initial_delay
                        .map(Duration::from_secs_f64)
                        .unwrap_or(defaults.initial_delay),
                    max_delay: max_delay
                        .map(Duration::from_secs_f64)
                        .unwrap_or(defaults.max_delay),
                    multiplier: multiplier.unwrap_or(defaults.multiplier),
                }
            }
        };

        Ok(Self {
            predicate,
            max_retries: max_retries.filter(|n| *n > 0).unwrap_or(DEFAULT_MAX_RETRIES),
            backoff,
        })
    }

    /// Decodes a runtime policy value (what a retry expression evaluated
    /// to).
    pub fn from_value(value: &Value) -> Result<Self> {
        let Some(map) = value.as_map() else {
            return Err(Exception::type_error(format!(
                "retry policy is not a map: got {}",
                value.kind()
            ))
            .into());
        };
        let map = map.read();

        let predicate = match map.get("predicate") {
            Some(Value::String(s)) => s.clone(),
            _ => return Err(RuntimeError::host("retry policy predicate: required")),
        };
        let Some(inner) = trim_embedded(&predicate) else {
            return Err(RuntimeError::host("retry policy predicate: not an expression"));
        };
        let predicate =
            Expr::parse(inner).map_err(|e| RuntimeError::host(format!("retry predicate: {e}")))?;

        let max_retries = match map.get("max_retries") {
            Some(value) => value
                .as_number()
                .map(|n| n as i64)
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_RETRIES),
            None => DEFAULT_MAX_RETRIES,
        };

        let defaults = Backoff::default();
        let backoff = match map.get("backoff").and_then(Value::as_map) {
            None => defaults,
            Some(backoff) => {
                let backoff = backoff.read();
                let seconds = |key: &str, fallback: Duration| {
                    backoff
                        .get(key)
                        .and_then(Value::as_number)
                        .map(Duration::from_secs_f64)
                        .unwrap_or(fallback)
                };
                Backoff {
                    initial_delay: seconds("initial_delay", defaults.initial_delay),
                    max_delay: seconds("max_delay", defaults.max_delay),
                    multiplier: backoff
                        .get("multiplier")
                        .and_then(Value::as_number)
                        .unwrap_or(defaults.multiplier),
                }
            }
        };

        Ok(Self {
            predicate,
            max_retries,
            backoff,
        })
    }

    pub fn into_state(self) -> RetryState {
        RetryState {
            delay: self.backoff.initial_delay,
            remaining: self.max_retries,
            policy: self,
        }
    }
}

/// Live retry bookkeeping for one `try` execution.
#[derive(Debug)]
pub(crate) struct RetryState {
    delay: Duration,
    remaining: i64,
    policy: CompiledRetryPolicy,
}

impl RetryState {
    /// Whether the exception should be retried: attempts must remain and
    /// the predicate must accept the exception payload.
    pub fn should_retry(&mut self, evaluator: &Evaluator, exception: &Exception) -> Result<bool> {
        if self.remaining <= 0 {
            return Ok(false);
        }
        let predicate = evaluator.evaluate_value(&self.policy.predicate)?;
        let Some(function) = predicate.as_function().cloned() else {
            return Err(RuntimeError::host("retry predicate is not a function"));
        };
        match function.call(vec![exception.payload()])? {
            Value::Bool(accept) => Ok(accept),
            other => Err(RuntimeError::host(format!(
                "retry predicate must return a boolean, got {}",
                other.kind()
            ))),
        }
    }

    /// Sleeps the current delay, then advances the schedule.
    pub fn backoff(&mut self) {
        tracing::debug!(delay = ?self.delay, remaining = self.remaining, "retry backoff");
        thread::sleep(self.delay);
        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.policy.backoff.multiplier)
                .min(self.policy.backoff.max_delay.as_secs_f64()),
        );
        self.remaining -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_policy_defaults() {
        let doc: serde_json::Value =
            serde_json::from_str(r#"{"predicate": "${retry.always}"}"#).expect("doc");
        let RetrySpec::Policy(policy) = RetrySpec::compile(&doc).expect("compile") else {
            panic!("expected a literal policy");
        };
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.backoff.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.backoff.max_delay, Duration::from_secs(60));
        assert!((policy.backoff.multiplier - 1.25).abs() < f64::EPSILON);
    }

    #[test]
    fn literal_policy_overrides() {
        let doc: serde_json::Value = serde_json::from_str(
            r#"{
                "predicate": "${retry.always}",
                "max_retries": 3,
                "backoff": {"initial_delay": 0.5, "max_delay": 2, "multiplier": 2}
            }"#,
        )
        .expect("doc");
        let RetrySpec::Policy(policy) = RetrySpec::compile(&doc).expect("compile") else {
            panic!("expected a literal policy");
        };
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff.initial_delay, Duration::from_millis(500));
        assert_eq!(policy.backoff.max_delay, Duration::from_secs(2));
    }

    #[test]
    fn missing_predicate_fails_compilation() {
        let doc: serde_json::Value = serde_json::from_str(r#"{"max_retries": 3}"#).expect("doc");
        assert!(RetrySpec::compile(&doc).is_err());
    }

    #[test]
    fn expression_retry_spec_compiles() {
        let doc = serde_json::Value::String("${http.default_retry}".to_string());
        assert!(matches!(
            RetrySpec::compile(&doc).expect("compile"),
            RetrySpec::Expr(_)
        ));
    }

    #[test]
    fn runtime_policy_value_decodes() {
        let mut backoff = std::collections::BTreeMap::new();
        backoff.insert("initial_delay".to_string(), Value::Float(0.1));
        backoff.insert("max_delay".to_string(), Value::Float(1.0));
        backoff.insert("multiplier".to_string(), Value::Float(3.0));
        let mut map = std::collections::BTreeMap::new();
        map.insert(
            "predicate".to_string(),
            Value::String("${retry.always}".to_string()),
        );
        map.insert("max_retries".to_string(), Value::Int(2));
        map.insert("backoff".to_string(), Value::from_map(backoff));

        let policy = CompiledRetryPolicy::from_value(&Value::from_map(map)).expect("decode");
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.backoff.initial_delay, Duration::from_millis(100));
        assert!((policy.backoff.multiplier - 3.0).abs() < f64::EPSILON);
    }
}

//! End-to-end workflow scenarios: compile a YAML document, run it, check
//! the result or the failure shape.

use std::sync::Arc;

use cadenza::types::ErrorTag;
use cadenza::{Exception, Value, WorkflowRoot};

fn compile(yaml: &str) -> Arc<WorkflowRoot> {
    WorkflowRoot::parse_yaml(yaml.as_bytes()).expect("compile")
}

fn run(yaml: &str, args: Value) -> Value {
    compile(yaml).execute(args).expect("execute")
}

#[test]
fn assign_and_return() {
    let result = run(
        r#"
main:
  params: [x]
  steps:
    - s1:
        assign:
          - y: "${x * 2}"
    - s2:
        return: "${y}"
"#,
        Value::Int(3),
    );
    assert_eq!(result, Value::Int(6));
}

#[test]
fn switch_picks_the_default_branch() {
    let yaml = r#"
main:
  params: [x]
  steps:
    - s:
        switch:
          - condition: "${x > 0}"
            return: "pos"
          - condition: "true"
            return: "neg"
"#;
    assert_eq!(
        run(yaml, Value::Int(-1)),
        Value::String("neg".into())
    );
    assert_eq!(run(yaml, Value::Int(2)), Value::String("pos".into()));
}

#[test]
fn switch_first_truthy_branch_wins_without_evaluating_later_ones() {
    // The second condition would fail on an unknown symbol if it were
    // ever evaluated.
    let result = run(
        r#"
main:
  steps:
    - s:
        switch:
          - condition: "${1 < 2}"
            return: "first"
          - condition: "${no_such_symbol > 1}"
            return: "second"
"#,
        Value::Null,
    );
    assert_eq!(result, Value::String("first".into()));
}

#[test]
fn try_except_binds_the_payload() {
    let result = run(
        r#"
main:
  steps:
    - t:
        try:
          raise:
            tags: ["MyErr"]
        except:
          as: e
          steps:
            - r:
                return: "${e.tags[0]}"
"#,
        Value::Null,
    );
    assert_eq!(result, Value::String("MyErr".into()));
}

#[test]
fn serial_for_accumulates() {
    let result = run(
        r#"
main:
  steps:
    - init:
        assign:
          - sum: 0
    - loop:
        for:
          value: i
          in: [1, 2, 3]
          steps:
            - add:
                assign:
                  - sum: "${sum + i}"
    - done:
        return: "${sum}"
"#,
        Value::Null,
    );
    assert_eq!(result, Value::Int(6));
}

#[test]
fn for_supports_break_and_continue() {
    let result = run(
        r#"
main:
  steps:
    - init:
        assign:
          - sum: 0
    - loop:
        for:
          value: i
          in: [1, 2, 3, 4, 5]
          steps:
            - check:
                switch:
                  - condition: "${i == 2}"
                    next: continue
                  - condition: "${i == 4}"
                    next: break
            - add:
                assign:
                  - sum: "${sum + i}"
    - done:
        return: "${sum}"
"#,
        Value::Null,
    );
    // 1 + 3; 2 skipped, loop broken at 4.
    assert_eq!(result, Value::Int(4));
}

#[test]
fn return_inside_a_loop_ends_the_invocation() {
    let result = run(
        r#"
main:
  steps:
    - loop:
        for:
          value: i
          in: [5, 6, 7]
          steps:
            - check:
                switch:
                  - condition: "${i == 6}"
                    return: "${i}"
    - fallback:
        return: 0
"#,
        Value::Null,
    );
    assert_eq!(result, Value::Int(6));
}

#[test]
fn named_jumps_and_terminal_end() {
    let result = run(
        r#"
main:
  steps:
    - first:
        next: third
    - second:
        return: "wrong"
    - third:
        return: "right"
"#,
        Value::Null,
    );
    assert_eq!(result, Value::String("right".into()));
}

#[test]
fn steps_fall_through_in_order() {
    let result = run(
        r#"
main:
  steps:
    - group:
        steps:
          - a:
              assign:
                - x: 1
          - b:
              assign:
                - x: "${x + 10}"
    - done:
        return: "${x}"
"#,
        Value::Null,
    );
    assert_eq!(result, Value::Int(11));
}

#[test]
fn sub_workflows_are_callable_with_named_args() {
    let yaml = r#"
main:
  params: [n]
  steps:
    - call_it:
        call: helper
        args:
          a: "${n}"
        result: out
    - done:
        return: "${out}"
helper:
  params: [a, {b: 5}]
  steps:
    - r:
        return: "${a + b}"
"#;
    assert_eq!(run(yaml, Value::Int(2)), Value::Int(7));
}

#[test]
fn sub_workflows_accept_positional_args() {
    let yaml = r#"
main:
  steps:
    - call_it:
        call: helper
        args: [3, 4]
        result: out
    - done:
        return: "${out}"
helper:
  params: [a, b]
  steps:
    - r:
        return: "${a * b}"
"#;
    assert_eq!(run(yaml, Value::Null), Value::Int(12));
}

#[test]
fn runaway_recursion_is_tagged() {
    let err = compile(
        r#"
main:
  steps:
    - go:
        call: spin
        result: out
    - done:
        return: "${out}"
spin:
  steps:
    - again:
        call: spin
        result: out
    - done:
        return: "${out}"
"#,
    )
    .execute(Value::Null)
    .expect_err("must exhaust recursion depth");
    assert_eq!(
        err.exception().and_then(Exception::tag),
        Some(ErrorTag::RecursionError)
    );
}

#[test]
fn retry_runs_the_body_exactly_max_retries_plus_one_times() {
    let started = std::time::Instant::now();
    let result = run(
        r#"
main:
  steps:
    - init:
        assign:
          - attempts: 0
    - t:
        try:
          steps:
            - bump:
                assign:
                  - attempts: "${attempts + 1}"
            - boom:
                raise: "kaput"
        retry:
          predicate: "${retry.always}"
          max_retries: 3
          backoff:
            initial_delay: 0.01
            max_delay: 0.04
            multiplier: 2
        except:
          as: e
          steps:
            - done:
                return: "${attempts}"
"#,
        Value::Null,
    );
    assert_eq!(result, Value::Int(4));
    // Backoff slept 0.01 + 0.02 + 0.04 seconds, capped at max_delay.
    assert!(started.elapsed() >= std::time::Duration::from_millis(65));
}

#[test]
fn retry_never_skips_straight_to_except() {
    let result = run(
        r#"
main:
  steps:
    - init:
        assign:
          - attempts: 0
    - t:
        try:
          steps:
            - bump:
                assign:
                  - attempts: "${attempts + 1}"
            - boom:
                raise: "kaput"
        retry: "${http.default_retry}"
        except:
          as: e
          steps:
            - done:
                return: "${attempts}"
"#,
        Value::Null,
    );
    // A string exception has no code; the HTTP predicate rejects it.
    assert_eq!(result, Value::Int(1));
}

#[test]
fn exhausted_retry_without_except_propagates() {
    let err = compile(
        r#"
main:
  steps:
    - t:
        try:
          raise: "kaput"
        retry:
          predicate: "${retry.always}"
          max_retries: 1
          backoff:
            initial_delay: 0.01
            max_delay: 0.01
            multiplier: 1
"#,
    )
    .execute(Value::Null)
    .expect_err("must propagate");
    assert!(matches!(
        err.exception(),
        Some(Exception::String(message)) if message == "kaput"
    ));
}

#[test]
fn raised_maps_are_visible_to_predicates_and_handlers() {
    let result = run(
        r#"
main:
  steps:
    - t:
        try:
          raise:
            code: 503
            message: "unavailable"
        retry:
          predicate: "${http.default_retry_predicate}"
          max_retries: 2
          backoff:
            initial_delay: 0.01
            max_delay: 0.01
            multiplier: 1
        except:
          as: e
          steps:
            - done:
                return: "${e.message}"
"#,
        Value::Null,
    );
    assert_eq!(result, Value::String("unavailable".into()));
}

#[test]
fn uncaught_string_exceptions_fail_the_invocation() {
    let err = compile(
        r#"
main:
  steps:
    - boom:
        raise: "broken"
"#,
    )
    .execute(Value::Null)
    .expect_err("must fail");
    assert!(matches!(
        err.exception(),
        Some(Exception::String(message)) if message == "broken"
    ));
    // The step name is part of the error chain.
    assert!(err.to_string().contains("boom"));
}

#[test]
fn null_arguments_still_bind_the_parameter() {
    let err = compile(
        r#"
main:
  params: [x]
  steps:
    - s:
        return: "${x}"
sub:
  steps:
    - s:
        return: 1
"#,
    )
    .execute(Value::Null)
    .err();
    // A null argument still binds the parameter, so this succeeds.
    assert!(err.is_none());
}

#[test]
fn expressions_see_workflow_params_defaults() {
    let result = run(
        r#"
main:
  params: [x]
  steps:
    - call_it:
        call: helper
        args: {}
        result: out
    - done:
        return: "${out}"
helper:
  params: [{greeting: "hello"}]
  steps:
    - r:
        return: "${greeting + \" world\"}"
"#,
        Value::Null,
    );
    assert_eq!(result, Value::String("hello world".into()));
}

#[test]
fn call_assigns_result_through_field_paths() {
    let result = run(
        r#"
main:
  steps:
    - init:
        assign:
          - data: {}
    - now:
        call: sys.now
        result: ts
    - stash:
        assign:
          - data.when: "${ts}"
    - done:
        return: "${data.when > 0}"
"#,
        Value::Null,
    );
    assert_eq!(result, Value::Bool(true));
}

#[test]
fn json_documents_compile_too() {
    let root = WorkflowRoot::parse_json(
        &br#"{"main": {"steps": [{"s": {"return": "${1 + 1}"}}]}}"#[..],
    )
    .expect("compile json");
    assert_eq!(root.execute(Value::Null).expect("execute"), Value::Int(2));
}

#[test]
fn document_numbers_keep_their_kinds() {
    let result = run(
        r#"
main:
  steps:
    - s:
        return: [1, 1.5]
"#,
        Value::Null,
    );
    let items = result.as_list().expect("list").read().clone();
    assert_eq!(items[0], Value::Int(1));
    assert!(matches!(items[1], Value::Float(f) if f == 1.5));
}

//! End-to-end expression evaluation against the standard library table.

use cadenza::expression::{Evaluator, Expr};
use cadenza::types::ErrorTag;
use cadenza::{Exception, Value};

fn evaluator() -> Evaluator {
    Evaluator::new(cadenza::stdlib::default_symbol_table().child())
}

fn eval(source: &str) -> Value {
    let ev = evaluator();
    ev.evaluate_value(&Expr::parse(source).expect("parse"))
        .expect("evaluate")
}

fn eval_err(source: &str) -> cadenza::RuntimeError {
    let ev = evaluator();
    ev.evaluate_value(&Expr::parse(source).expect("parse"))
        .expect_err("expected an error")
}

#[test]
fn reference_arithmetic_scenario() {
    // ${1 + 2 - 3 * 4 // 5} from the language reference.
    assert_eq!(eval("1 + 2 - 3 * 4 // 5"), Value::Int(1));
}

#[test]
fn precedence_round_trip() {
    for (a, b, c) in [(2i64, 3i64, 4i64), (7, -2, 5), (0, 9, 9)] {
        let plain = eval(&format!("{a} + {b} * {c}"));
        assert_eq!(plain, Value::Int(a + b * c));
        let grouped = eval(&format!("({a} + {b}) * {c}"));
        assert_eq!(grouped, Value::Int((a + b) * c));
    }
}

#[test]
fn division_typing() {
    assert!(matches!(eval("7 / 2"), Value::Float(f) if f == 3.5));
    assert!(matches!(eval("4 / 2"), Value::Float(f) if f == 2.0));
    assert_eq!(eval("7 // 2"), Value::Int(3));
    assert_eq!(eval("7 % 2"), Value::Int(1));
    assert_eq!(eval("-7 // 2"), Value::Int(-4));
}

#[test]
fn null_equality() {
    assert_eq!(eval("null == null"), Value::Bool(true));
    assert_eq!(eval("1 == null"), Value::Bool(false));
    assert_eq!(eval("1 != null"), Value::Bool(true));
    assert_eq!(eval("\"\" == null"), Value::Bool(false));
    // A function call that returned null compares as nil too.
    assert_eq!(eval("map.get(null, \"k\") == null"), Value::Bool(true));
}

#[test]
fn field_path_provenance() {
    let ev = evaluator();
    let inner = Value::from_map(
        [(
            "k".to_string(),
            Value::from_values(vec![
                Value::Int(0),
                Value::Int(1),
                Value::Int(2),
                Value::Int(30),
            ]),
        )]
        .into_iter()
        .collect(),
    );
    let outer = Value::from_map([("f".to_string(), inner)].into_iter().collect());
    ev.symbol_table.set("sym", outer).expect("seed");

    let expr = Expr::parse("sym.f[\"k\"][3]").expect("parse");
    let reference = ev.resolve_reference(&expr).expect("reference");
    let resolved = reference.resolve_value(&ev.symbol_table).expect("resolve");
    assert_eq!(resolved.path, "sym.f[\"k\"][3]");
    assert_eq!(resolved.value, Value::Int(30));
}

#[test]
fn stdlib_calls_compose() {
    assert_eq!(eval("len(text.split(\"a,b,c\", \",\"))"), Value::Int(3));
    assert_eq!(eval("int(\"4\") + double(\"0.5\")"), Value::Float(4.5));
    assert_eq!(eval("math.max(2, 3) * math.min(4, 5)"), Value::Int(12));
    assert_eq!(
        eval("text.to_upper(\"ab\") + string(7)"),
        Value::String("AB7".into())
    );
}

#[test]
fn membership_operators() {
    let ev = evaluator();
    ev.symbol_table
        .set(
            "xs",
            Value::from_values(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        )
        .expect("seed");
    ev.symbol_table
        .set(
            "names",
            Value::from_values(vec![
                Value::String("a".into()),
                Value::String("b".into()),
            ]),
        )
        .expect("seed");
    ev.symbol_table
        .set(
            "m",
            Value::from_map([("k".to_string(), Value::Int(1))].into_iter().collect()),
        )
        .expect("seed");

    let check = |source: &str, expected: bool| {
        let value = ev
            .evaluate_value(&Expr::parse(source).expect("parse"))
            .expect("evaluate");
        assert_eq!(value, Value::Bool(expected), "source {source}");
    };
    check("2 in xs", true);
    check("5 in xs", false);
    check("\"b\" in names", true);
    check("\"z\" in names", false);
    check("\"k\" in m", true);
    check("\"x\" in m", false);
}

#[test]
fn zero_division_is_tagged() {
    for source in ["1 / 0", "1 // 0", "1 % 0"] {
        let err = eval_err(source);
        assert_eq!(
            err.exception().and_then(Exception::tag),
            Some(ErrorTag::ZeroDivisionError),
            "source {source}"
        );
    }
}

#[test]
fn type_errors_are_tagged() {
    let err = eval_err("\"a\" - 1");
    assert_eq!(
        err.exception().and_then(Exception::tag),
        Some(ErrorTag::TypeError)
    );
    let err = eval_err("-\"a\"");
    assert_eq!(
        err.exception().and_then(Exception::tag),
        Some(ErrorTag::TypeError)
    );
}

#[test]
fn missing_symbols_and_keys() {
    let err = eval_err("no_such_symbol + 1");
    assert_eq!(
        err.exception().and_then(Exception::tag),
        Some(ErrorTag::TypeError)
    );

    let ev = evaluator();
    ev.symbol_table
        .set("m", Value::empty_map())
        .expect("seed");
    let err = ev
        .evaluate_value(&Expr::parse("m.absent").expect("parse"))
        .expect_err("missing key");
    assert_eq!(
        err.exception().and_then(Exception::tag),
        Some(ErrorTag::KeyError)
    );
}

#[test]
fn negative_index_is_an_index_error() {
    let ev = evaluator();
    ev.symbol_table
        .set("xs", Value::from_values(vec![Value::Int(1)]))
        .expect("seed");
    let err = ev
        .evaluate_value(&Expr::parse("xs[0 - 1]").expect("parse"))
        .expect_err("negative index");
    assert_eq!(
        err.exception().and_then(Exception::tag),
        Some(ErrorTag::IndexError)
    );
}

#[test]
fn calls_require_functions() {
    let ev = evaluator();
    ev.symbol_table.set("n", Value::Int(3)).expect("seed");
    let err = ev
        .evaluate_value(&Expr::parse("n()").expect("parse"))
        .expect_err("not callable");
    assert_eq!(
        err.exception().and_then(Exception::tag),
        Some(ErrorTag::TypeError)
    );
}

#[test]
fn stdlib_results_are_indexable() {
    let ev = evaluator();
    ev.symbol_table
        .set("xs", Value::from_values(vec![Value::Int(1), Value::Int(2)]))
        .expect("seed");
    assert_eq!(
        ev.evaluate_value(&Expr::parse("list.concat(xs, 3)[2]").expect("parse"))
            .expect("evaluate"),
        Value::Int(3)
    );
    assert_eq!(
        ev.evaluate_value(&Expr::parse("len(json.decode(\"{\\\"a\\\": 5}\"))").expect("parse"))
            .expect("evaluate"),
        Value::Int(1)
    );
}

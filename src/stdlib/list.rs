//! `list.*` built-ins.

use crate::types::{Argument, Function, Value};

use super::{namespace_of, want_list};

pub(crate) fn namespace() -> Value {
    Value::from_map(namespace_of(
        "list",
        vec![Function::new(
            "list.concat",
            vec![Argument::required("objs"), Argument::required("val")],
            |args| {
                let list = want_list(&args[0], "objs")?;
                // Returns a fresh list; the input must stay untouched.
                let mut items = list.read().clone();
                items.push(args[1].clone());
                Ok(Value::from_values(items))
            },
        )],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_does_not_mutate_the_input() {
        let ns = namespace();
        let ns = ns.as_map().unwrap().read().clone();
        let original = Value::from_values(vec![Value::Int(1)]);
        let out = ns["concat"]
            .as_function()
            .unwrap()
            .call(vec![original.clone(), Value::Int(2)])
            .unwrap();
        assert_eq!(original.as_list().unwrap().read().len(), 1);
        assert_eq!(out.as_list().unwrap().read().len(), 2);
    }
}

use regex::Regex;
use serde_json::{Map, Number, Value};

use crate::{
    ast::{BinaryOp, Expr, PathSeg},
    CompileError, CompiledProgram, EvalError, Functions,
};

// Built-in zero-conf filters and their arities. `test` is handled separately
// because its pattern is compiled with the program.
const INTRINSICS: &[(&str, usize)] = &[
    ("select", 1),
    ("not", 0),
    ("length", 0),
    ("has", 1),
    ("tostring", 0),
    ("error", 1),
];

/// A compiled program: a checked syntax tree plus the host functions it may call.
pub struct Program {
    root: Expr,
    functions: Functions,
}

impl Program {
    pub(crate) fn new(root: Expr, functions: Functions) -> Result<Self, CompileError> {
        let root = resolve(root, &functions)?;
        Ok(Self { root, functions })
    }
}

impl CompiledProgram for Program {
    fn run(&self, input: &Value) -> Result<Option<Value>, EvalError> {
        self.eval(&self.root, input)
    }
}

/// Validates every call site and rewrites `test()` patterns into compiled regexes.
fn resolve(expr: Expr, functions: &Functions) -> Result<Expr, CompileError> {
    match expr {
        Expr::Call { name, args } => {
            let args = args
                .into_iter()
                .map(|arg| resolve(arg, functions))
                .collect::<Result<Vec<_>, _>>()?;

            if name == "test" {
                if args.len() != 1 {
                    return Err(CompileError::WrongArity {
                        name,
                        expected: 1,
                        given: args.len(),
                    });
                }
                let pattern = match &args[0] {
                    Expr::Literal(Value::String(s)) => s.clone(),
                    _ => return Err(CompileError::NonLiteralRegex),
                };
                let regex = Regex::new(&pattern).map_err(|source| CompileError::InvalidRegex {
                    pattern,
                    source,
                })?;
                return Ok(Expr::RegexTest(regex));
            }

            if let Some((_, arity)) = INTRINSICS.iter().find(|(n, _)| *n == name) {
                if args.len() != *arity {
                    return Err(CompileError::WrongArity {
                        name,
                        expected: *arity,
                        given: args.len(),
                    });
                }
                return Ok(Expr::Call { name, args });
            }

            match functions.lookup(&name) {
                Some(host) if host.arity == args.len() => Ok(Expr::Call { name, args }),
                Some(host) => Err(CompileError::WrongArity {
                    name,
                    expected: host.arity,
                    given: args.len(),
                }),
                None => Err(CompileError::UnknownFunction {
                    name,
                    arity: args.len(),
                }),
            }
        }
        Expr::Path { target, segs } => Ok(Expr::Path {
            target: match target {
                Some(t) => Some(Box::new(resolve(*t, functions)?)),
                None => None,
            },
            segs,
        }),
        Expr::Array(items) => Ok(Expr::Array(
            items
                .into_iter()
                .map(|item| resolve(item, functions))
                .collect::<Result<_, _>>()?,
        )),
        Expr::Object(entries) => Ok(Expr::Object(
            entries
                .into_iter()
                .map(|(k, v)| Ok((k, resolve(v, functions)?)))
                .collect::<Result<_, CompileError>>()?,
        )),
        Expr::Neg(inner) => Ok(Expr::Neg(Box::new(resolve(*inner, functions)?))),
        Expr::Binary { op, lhs, rhs } => Ok(Expr::Binary {
            op,
            lhs: Box::new(resolve(*lhs, functions)?),
            rhs: Box::new(resolve(*rhs, functions)?),
        }),
        Expr::And(lhs, rhs) => Ok(Expr::And(
            Box::new(resolve(*lhs, functions)?),
            Box::new(resolve(*rhs, functions)?),
        )),
        Expr::Or(lhs, rhs) => Ok(Expr::Or(
            Box::new(resolve(*lhs, functions)?),
            Box::new(resolve(*rhs, functions)?),
        )),
        Expr::Pipe(lhs, rhs) => Ok(Expr::Pipe(
            Box::new(resolve(*lhs, functions)?),
            Box::new(resolve(*rhs, functions)?),
        )),
        Expr::Alternative(lhs, rhs) => Ok(Expr::Alternative(
            Box::new(resolve(*lhs, functions)?),
            Box::new(resolve(*rhs, functions)?),
        )),
        Expr::If { clauses, otherwise } => Ok(Expr::If {
            clauses: clauses
                .into_iter()
                .map(|(c, b)| Ok((resolve(c, functions)?, resolve(b, functions)?)))
                .collect::<Result<_, CompileError>>()?,
            otherwise: match otherwise {
                Some(o) => Some(Box::new(resolve(*o, functions)?)),
                None => None,
            },
        }),
        leaf @ (Expr::Literal(_) | Expr::RegexTest(_)) => Ok(leaf),
    }
}

fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn float_value(f: f64) -> Result<Value, EvalError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| EvalError::failure(format!("number {} is not representable", f)))
}

// Numeric equality ignores integer/float representation, so `1 == 1.0`.
fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => lhs == rhs,
    }
}

impl Program {
    fn eval(&self, expr: &Expr, input: &Value) -> Result<Option<Value>, EvalError> {
        match expr {
            Expr::Literal(v) => Ok(Some(v.clone())),

            Expr::Path { target, segs } => {
                let base = match target {
                    Some(inner) => match self.eval(inner, input)? {
                        Some(v) => v,
                        None => return Ok(None),
                    },
                    None => input.clone(),
                };
                eval_path(&base, segs).map(Some)
            }

            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(v) = self.eval(item, input)? {
                        out.push(v);
                    }
                }
                Ok(Some(Value::Array(out)))
            }

            Expr::Object(entries) => {
                let mut out = Map::new();
                for (key, value_expr) in entries {
                    match self.eval(value_expr, input)? {
                        Some(v) => {
                            out.insert(key.clone(), v);
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some(Value::Object(out)))
            }

            Expr::Neg(inner) => match self.eval(inner, input)? {
                None => Ok(None),
                Some(Value::Number(n)) => {
                    if let Some(i) = n.as_i64().and_then(i64::checked_neg) {
                        Ok(Some(Value::Number(Number::from(i))))
                    } else {
                        let f = n.as_f64().unwrap_or(f64::NAN);
                        float_value(-f).map(Some)
                    }
                }
                Some(other) => Err(EvalError::failure(format!(
                    "cannot negate {}",
                    type_name(&other)
                ))),
            },

            Expr::Binary { op, lhs, rhs } => {
                let lhs = match self.eval(lhs, input)? {
                    Some(v) => v,
                    None => return Ok(None),
                };
                let rhs = match self.eval(rhs, input)? {
                    Some(v) => v,
                    None => return Ok(None),
                };
                eval_binary(*op, &lhs, &rhs).map(Some)
            }

            Expr::And(lhs, rhs) => match self.eval(lhs, input)? {
                None => Ok(None),
                Some(l) if !truthy(&l) => Ok(Some(Value::Bool(false))),
                Some(_) => match self.eval(rhs, input)? {
                    None => Ok(None),
                    Some(r) => Ok(Some(Value::Bool(truthy(&r)))),
                },
            },

            Expr::Or(lhs, rhs) => match self.eval(lhs, input)? {
                None => Ok(None),
                Some(l) if truthy(&l) => Ok(Some(Value::Bool(true))),
                Some(_) => match self.eval(rhs, input)? {
                    None => Ok(None),
                    Some(r) => Ok(Some(Value::Bool(truthy(&r)))),
                },
            },

            Expr::Pipe(lhs, rhs) => match self.eval(lhs, input)? {
                None => Ok(None),
                Some(v) => self.eval(rhs, &v),
            },

            Expr::Alternative(lhs, rhs) => match self.eval(lhs, input) {
                Ok(Some(v)) if truthy(&v) => Ok(Some(v)),
                Err(e) if e.is_skip() => Err(e),
                _ => self.eval(rhs, input),
            },

            Expr::If { clauses, otherwise } => {
                for (cond, branch) in clauses {
                    match self.eval(cond, input)? {
                        None => return Ok(None),
                        Some(c) if truthy(&c) => return self.eval(branch, input),
                        Some(_) => {}
                    }
                }
                match otherwise {
                    Some(branch) => self.eval(branch, input),
                    // As in jq, a missing else branch passes the input through.
                    None => Ok(Some(input.clone())),
                }
            }

            Expr::RegexTest(regex) => match input {
                Value::String(s) => Ok(Some(Value::Bool(regex.is_match(s)))),
                other => Err(EvalError::failure(format!(
                    "cannot match {} against a regex",
                    type_name(other)
                ))),
            },

            Expr::Call { name, args } => self.eval_call(name, args, input),
        }
    }

    fn eval_call(&self, name: &str, args: &[Expr], input: &Value) -> Result<Option<Value>, EvalError> {
        match name {
            "select" => match self.eval(&args[0], input)? {
                Some(cond) if truthy(&cond) => Ok(Some(input.clone())),
                _ => Ok(None),
            },
            "not" => Ok(Some(Value::Bool(!truthy(input)))),
            "length" => eval_length(input).map(Some),
            "has" => {
                let key = match self.eval(&args[0], input)? {
                    Some(v) => v,
                    None => return Ok(None),
                };
                eval_has(input, &key).map(Some)
            }
            "tostring" => match input {
                Value::String(s) => Ok(Some(Value::String(s.clone()))),
                other => serde_json::to_string(other)
                    .map(|s| Some(Value::String(s)))
                    .map_err(|e| EvalError::failure(e.to_string())),
            },
            "error" => {
                let message = match self.eval(&args[0], input)? {
                    Some(Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => "error".to_string(),
                };
                Err(EvalError::failure(message))
            }
            _ => {
                // Resolution already guaranteed the host function exists with
                // this arity.
                let host = self
                    .functions
                    .lookup(name)
                    .ok_or_else(|| EvalError::failure(format!("function '{}' vanished", name)))?;

                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    match self.eval(arg, input)? {
                        Some(v) => evaluated.push(v),
                        None => return Ok(None),
                    }
                }
                (host.callback)(input, &evaluated).map(Some)
            }
        }
    }
}

static NULL: Value = Value::Null;

fn eval_path(base: &Value, segs: &[PathSeg]) -> Result<Value, EvalError> {
    let mut cur = base;
    for seg in segs {
        // Once null, every further segment stays null, as missing fields do.
        if matches!(cur, Value::Null) {
            break;
        }
        cur = match (seg, cur) {
            (PathSeg::Field(name) | PathSeg::Key(name), Value::Object(map)) => {
                map.get(name).unwrap_or(&NULL)
            }
            (PathSeg::Index(idx), Value::Array(items)) => {
                let len = items.len() as i64;
                let idx = if *idx < 0 { len + idx } else { *idx };
                if idx < 0 || idx >= len {
                    &NULL
                } else {
                    &items[idx as usize]
                }
            }
            (PathSeg::Field(name) | PathSeg::Key(name), other) => {
                return Err(EvalError::failure(format!(
                    "cannot index {} with \"{}\"",
                    type_name(other),
                    name
                )))
            }
            (PathSeg::Index(idx), other) => {
                return Err(EvalError::failure(format!(
                    "cannot index {} with {}",
                    type_name(other),
                    idx
                )))
            }
        };
    }
    Ok(cur.clone())
}

fn eval_length(input: &Value) -> Result<Value, EvalError> {
    match input {
        Value::Null => Ok(Value::Number(0.into())),
        Value::String(s) => Ok(Value::Number((s.chars().count() as i64).into())),
        Value::Array(items) => Ok(Value::Number((items.len() as i64).into())),
        Value::Object(map) => Ok(Value::Number((map.len() as i64).into())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64().and_then(i64::checked_abs) {
                Ok(Value::Number(i.into()))
            } else {
                float_value(n.as_f64().unwrap_or(f64::NAN).abs())
            }
        }
        Value::Bool(_) => Err(EvalError::failure("boolean has no length")),
    }
}

fn eval_has(input: &Value, key: &Value) -> Result<Value, EvalError> {
    match (input, key) {
        (Value::Object(map), Value::String(k)) => Ok(Value::Bool(map.contains_key(k))),
        (Value::Array(items), Value::Number(n)) => {
            let idx = n.as_i64().unwrap_or(-1);
            Ok(Value::Bool(idx >= 0 && (idx as usize) < items.len()))
        }
        (input, key) => Err(EvalError::failure(format!(
            "cannot check {} for key of type {}",
            type_name(input),
            type_name(key)
        ))),
    }
}

fn eval_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    use BinaryOp::*;

    match op {
        Eq => return Ok(Value::Bool(values_equal(lhs, rhs))),
        Ne => return Ok(Value::Bool(!values_equal(lhs, rhs))),
        Lt | Le | Gt | Ge => return eval_ordering(op, lhs, rhs),
        _ => {}
    }

    match (op, lhs, rhs) {
        // `null + x` and `x + null` pass x through.
        (Add, Value::Null, other) | (Add, other, Value::Null) => Ok(other.clone()),
        (Add, Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
        (Add, Value::Array(a), Value::Array(b)) => {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            Ok(Value::Array(out))
        }
        (Add, Value::Object(a), Value::Object(b)) => {
            let mut out = a.clone();
            for (k, v) in b {
                out.insert(k.clone(), v.clone());
            }
            Ok(Value::Object(out))
        }
        (_, Value::Number(a), Value::Number(b)) => eval_arithmetic(op, a, b),
        (op, lhs, rhs) => Err(EvalError::failure(format!(
            "{} and {} cannot be combined with '{}'",
            type_name(lhs),
            type_name(rhs),
            op.symbol()
        ))),
    }
}

fn eval_arithmetic(op: BinaryOp, a: &Number, b: &Number) -> Result<Value, EvalError> {
    use BinaryOp::*;

    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        // Integer arithmetic stays integral except for division.
        let int_result = match op {
            Add => a.checked_add(b),
            Sub => a.checked_sub(b),
            Mul => a.checked_mul(b),
            Mod => {
                if b == 0 {
                    return Err(EvalError::failure("modulo by zero"));
                }
                a.checked_rem(b)
            }
            _ => None,
        };
        if let Some(result) = int_result {
            return Ok(Value::Number(result.into()));
        }
    }

    let (af, bf) = match (a.as_f64(), b.as_f64()) {
        (Some(af), Some(bf)) => (af, bf),
        _ => return Err(EvalError::failure("number out of range")),
    };

    match op {
        Add => float_value(af + bf),
        Sub => float_value(af - bf),
        Mul => float_value(af * bf),
        Div => {
            if bf == 0.0 {
                Err(EvalError::failure("division by zero"))
            } else {
                float_value(af / bf)
            }
        }
        Mod => {
            let (ai, bi) = (af.trunc() as i64, bf.trunc() as i64);
            if bi == 0 {
                Err(EvalError::failure("modulo by zero"))
            } else {
                Ok(Value::Number((ai % bi).into()))
            }
        }
        _ => unreachable!("comparisons handled before arithmetic"),
    }
}

fn eval_ordering(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    use std::cmp::Ordering;

    let ordering = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };

    let ordering = ordering.ok_or_else(|| {
        EvalError::failure(format!(
            "cannot order {} against {}",
            type_name(lhs),
            type_name(rhs)
        ))
    })?;

    let result = match op {
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::Le => ordering != Ordering::Greater,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::Ge => ordering != Ordering::Less,
        _ => unreachable!("only orderings reach here"),
    };
    Ok(Value::Bool(result))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{Engine as _, Interpreter};

    fn host_functions() -> Functions {
        Functions::default()
            .with_function("event", 3, |_, args| {
                Ok(json!({
                    "namespace": args[0],
                    "time": args[1],
                    "metrics": args[2],
                }))
            })
            .with_function("skip", 1, |_, args| {
                let reason = args[0].as_str().unwrap_or("unspecified").to_string();
                Err(EvalError::Skip { reason })
            })
    }

    fn run(source: &str, input: &Value) -> Result<Option<Value>, EvalError> {
        let engine = Interpreter::new(host_functions());
        let program = engine
            .compile(source)
            .unwrap_or_else(|e| panic!("'{}' failed to compile: {}", source, e));
        program.run(input)
    }

    fn run_value(source: &str, input: &Value) -> Value {
        run(source, input)
            .unwrap_or_else(|e| panic!("'{}' failed to run: {}", source, e))
            .unwrap_or_else(|| panic!("'{}' produced no output", source))
    }

    #[test]
    fn paths_follow_json_structure() {
        let input = json!({ "a": { "b": [10, 20, 30] }, "n": null });

        assert_eq!(run_value(".a.b[1]", &input), json!(20));
        assert_eq!(run_value(".a.b[-1]", &input), json!(30));
        assert_eq!(run_value(".missing", &input), Value::Null);
        assert_eq!(run_value(".missing.deeper", &input), Value::Null);
        assert_eq!(run_value(".n.anything", &input), Value::Null);
        assert_eq!(run_value(".a.b[9]", &input), Value::Null);
    }

    #[test]
    fn indexing_scalars_fails() {
        let input = json!({ "a": 4 });
        let err = run(".a.b", &input).unwrap_err();
        assert!(!err.is_skip());
    }

    #[test]
    fn arithmetic_keeps_integers_integral() {
        let input = json!({});
        assert_eq!(run_value("2 + 3", &input), json!(5));
        assert_eq!(run_value("2 * 3 + 1", &input), json!(7));
        assert_eq!(run_value("7 % 3", &input), json!(1));
        assert_eq!(run_value("12.5 / 5", &input), json!(2.5));
        assert_eq!(run_value("1 / 2", &input), json!(0.5));
        assert!(run("1 / 0", &input).is_err());
    }

    #[test]
    fn comparisons_and_boolean_operators() {
        let input = json!({ "code": 200, "region": "eu" });

        assert_eq!(run_value(r#".code >= 200 and .region == "eu""#, &input), json!(true));
        assert_eq!(run_value(r#".code > 500 or .region == "eu""#, &input), json!(true));
        assert_eq!(run_value(".code == 200.0", &input), json!(true));
        assert_eq!(run_value(".missing == null", &input), json!(true));
        assert_eq!(run_value(".code > 500 | not", &input), json!(true));
    }

    #[test]
    fn group_lists_build_with_array_concat() {
        let program = r#"
            (if .dmn == "payments" then ["payments"] else [] end)
            + (if .rgn == "eu" then ["regional"] else [] end)
        "#;

        assert_eq!(
            run_value(program, &json!({ "dmn": "payments", "rgn": "eu" })),
            json!(["payments", "regional"])
        );
        assert_eq!(
            run_value(program, &json!({ "dmn": "payments", "rgn": "us" })),
            json!(["payments"])
        );
        assert_eq!(run_value(program, &json!({ "dmn": "ads" })), json!([]));
    }

    #[test]
    fn select_yields_nothing_on_mismatch() {
        let input = json!({ "x": 1 });
        assert_eq!(run_value("select(.x == 1)", &input), input);
        assert_eq!(run("select(.x == 2)", &input).unwrap(), None);
    }

    #[test]
    fn fallback_covers_empty_false_and_failure() {
        let input = json!({ "x": 1 });

        assert_eq!(run_value("select(.x == 2) // \"fallback\"", &input), json!("fallback"));
        assert_eq!(run_value("false // 3", &input), json!(3));
        assert_eq!(run_value(".missing // 3", &input), json!(3));
        assert_eq!(run_value("error(\"boom\") // 3", &input), json!(3));
        assert_eq!(run_value(".x // 3", &input), json!(1));
    }

    #[test]
    fn skip_sentinel_is_not_swallowed_by_fallback() {
        let input = json!({ "x": 1 });

        let err = run(r#"select(.x == 2) // skip("nope")"#, &input).unwrap_err();
        assert!(err.is_skip());

        let err = run(r#"skip("early") // 3"#, &input).unwrap_err();
        assert!(err.is_skip());
    }

    #[test]
    fn event_host_function_packages_maps() {
        let input = json!({ "stts": "OK", "strt": "2024-05-02T10:00:00Z" });
        let program = r#"
            select(.stts == "OK") // skip("checkout")
            | event("checkout"; .strt; { requests: 1, latency: (.dur // 0) })
        "#;

        let out = run_value(program, &input);
        assert_eq!(out["namespace"], json!("checkout"));
        assert_eq!(out["time"], json!("2024-05-02T10:00:00Z"));
        assert_eq!(out["metrics"], json!({ "requests": 1, "latency": 0 }));
    }

    #[test]
    fn if_without_else_passes_input_through() {
        let input = json!({ "x": 5 });
        assert_eq!(run_value("if .x == 9 then \"hit\" end", &input), input);
        assert_eq!(run_value("if .x == 5 then \"hit\" end", &input), json!("hit"));
    }

    #[test]
    fn regex_test_precompiles() {
        let input = json!({ "code": "E-1234" });
        assert_eq!(run_value(r#".code | test("^E-\\d+$")"#, &input), json!(true));
        assert_eq!(run_value(r#".code | test("^W-")"#, &input), json!(false));

        let engine = Interpreter::new(host_functions());
        assert!(matches!(
            engine.compile(r#".code | test("[unclosed")"#),
            Err(CompileError::InvalidRegex { .. })
        ));
        assert!(matches!(
            engine.compile(r#".code | test(.pattern)"#),
            Err(CompileError::NonLiteralRegex)
        ));
    }

    #[test]
    fn unknown_functions_and_arity_are_compile_errors() {
        let engine = Interpreter::new(host_functions());

        assert!(matches!(
            engine.compile("mystery(.a)"),
            Err(CompileError::UnknownFunction { .. })
        ));
        assert!(matches!(
            engine.compile(r#"event("ns"; .t)"#),
            Err(CompileError::WrongArity { expected: 3, given: 2, .. })
        ));
        assert!(matches!(
            engine.compile("select(.a; .b)"),
            Err(CompileError::WrongArity { .. })
        ));
    }

    #[test]
    fn length_tostring_has() {
        let input = json!({ "items": [1, 2, 3], "name": "weir" });

        assert_eq!(run_value(".items | length", &input), json!(3));
        assert_eq!(run_value(".name | length", &input), json!(4));
        assert_eq!(run_value(".items[0] | tostring", &input), json!("1"));
        assert_eq!(run_value(r#"has("name")"#, &input), json!(true));
        assert_eq!(run_value(r#"has("nope")"#, &input), json!(false));
    }

    #[test]
    fn runs_are_deterministic() {
        let engine = Interpreter::new(host_functions());
        let program = engine
            .compile(r#"{ out: (.a + .b), tag: (.t // "none") }"#)
            .unwrap();

        let input = json!({ "a": 2, "b": 40 });
        let first = program.run(&input).unwrap();
        let second = program.run(&input).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Some(json!({ "out": 42, "tag": "none" })));
    }
}

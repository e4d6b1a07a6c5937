//! Functions and methods that need no entity context.

use rand::Rng;

use super::value::Value;
use crate::error::ScriptError;

const MAX_RANGE_LEN: i64 = 1_000_000;

/// Call a pure built-in function; `None` when `name` is not one
pub fn call_function(name: &str, args: &[Value]) -> Option<Result<Value, ScriptError>> {
    let result = match name {
        "len" => one(name, args).and_then(|v| length(name, v)),
        "int" => one(name, args).and_then(|v| to_int(name, v)),
        "float" => one(name, args).and_then(|v| to_float(name, v)),
        "str" => one(name, args).map(|v| Value::Str(v.to_string())),
        "abs" => one(name, args).and_then(|v| match v {
            Value::Int(i) => Ok(Value::Int(i.wrapping_abs())),
            Value::Float(f) => Ok(Value::Float(f.abs())),
            other => Err(ScriptError::argument(name, format!("expects a number, got {}", other.type_name()))),
        }),
        "min" => extreme(name, args, std::cmp::Ordering::Less),
        "max" => extreme(name, args, std::cmp::Ordering::Greater),
        "round" => round(args),
        "range" => range(args),
        "random" => random(args),
        "randomize_delay" => randomize_delay(args),
        "type" => one(name, args).map(|v| Value::Str(v.type_name().to_string())),
        _ => return None,
    };
    Some(result)
}

/// Call a method on a string or list value
pub fn call_method(receiver: &Value, name: &str, args: &[Value]) -> Result<Value, ScriptError> {
    match receiver {
        Value::Str(s) => string_method(s, name, args),
        Value::List(items) => list_method(items, name, args),
        other => Err(ScriptError::UnknownAttribute {
            object: other.type_name().to_string(),
            name: name.to_string(),
        }),
    }
}

fn one<'a>(name: &str, args: &'a [Value]) -> Result<&'a Value, ScriptError> {
    match args {
        [value] => Ok(value),
        _ => Err(ScriptError::argument(
            name,
            format!("takes exactly 1 argument ({} given)", args.len()),
        )),
    }
}

fn number(name: &str, value: &Value) -> Result<f64, ScriptError> {
    value.as_f64().ok_or_else(|| {
        ScriptError::argument(name, format!("expects a number, got {}", value.type_name()))
    })
}

fn integer(name: &str, value: &Value) -> Result<i64, ScriptError> {
    value.as_i64().ok_or_else(|| {
        ScriptError::argument(name, format!("expects an integer, got {}", value.type_name()))
    })
}

fn length(name: &str, value: &Value) -> Result<Value, ScriptError> {
    match value {
        Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
        Value::List(items) => Ok(Value::Int(items.len() as i64)),
        other => Err(ScriptError::argument(
            name,
            format!("has no length for {}", other.type_name()),
        )),
    }
}

fn to_int(name: &str, value: &Value) -> Result<Value, ScriptError> {
    match value {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Float(f) if f.is_finite() => Ok(Value::Int(f.trunc() as i64)),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Str(s) => s
            .trim()
            .parse()
            .map(Value::Int)
            .map_err(|_| ScriptError::argument(name, format!("invalid literal '{}'", s))),
        other => Err(ScriptError::argument(
            name,
            format!("cannot convert {}", other.type_name()),
        )),
    }
}

fn to_float(name: &str, value: &Value) -> Result<Value, ScriptError> {
    match value {
        Value::Str(s) => s
            .trim()
            .parse()
            .map(Value::Float)
            .map_err(|_| ScriptError::argument(name, format!("invalid literal '{}'", s))),
        other => number(name, other).map(Value::Float),
    }
}

fn extreme(name: &str, args: &[Value], want: std::cmp::Ordering) -> Result<Value, ScriptError> {
    let items = match args {
        [Value::List(items)] => items.as_slice(),
        _ => args,
    };
    let mut best: Option<&Value> = None;
    for item in items {
        best = match best {
            None => Some(item),
            Some(current) => match item.compare(current) {
                Some(ordering) if ordering == want => Some(item),
                Some(_) => Some(current),
                None => {
                    return Err(ScriptError::argument(
                        name,
                        format!(
                            "cannot compare {} and {}",
                            item.type_name(),
                            current.type_name()
                        ),
                    ))
                }
            },
        };
    }
    best.cloned()
        .ok_or_else(|| ScriptError::argument(name, "needs at least one value"))
}

fn round(args: &[Value]) -> Result<Value, ScriptError> {
    match args {
        [value] => {
            let x = number("round", value)?;
            Ok(Value::Int(x.round() as i64))
        }
        [value, digits] => {
            let x = number("round", value)?;
            let digits = integer("round", digits)?.clamp(0, 12) as i32;
            let factor = 10f64.powi(digits);
            Ok(Value::Float((x * factor).round() / factor))
        }
        _ => Err(ScriptError::argument("round", "takes 1 or 2 arguments")),
    }
}

fn range(args: &[Value]) -> Result<Value, ScriptError> {
    let (start, end, step) = match args {
        [end] => (0, integer("range", end)?, 1),
        [start, end] => (integer("range", start)?, integer("range", end)?, 1),
        [start, end, step] => (
            integer("range", start)?,
            integer("range", end)?,
            integer("range", step)?,
        ),
        _ => return Err(ScriptError::argument("range", "takes 1 to 3 arguments")),
    };
    if step == 0 {
        return Err(ScriptError::argument("range", "step must not be zero"));
    }
    // Widened so the length of any i64 range is representable
    let (start, end, step) = (i128::from(start), i128::from(end), i128::from(step));
    let len = if step > 0 {
        (end - start + step - 1).div_euclid(step)
    } else {
        (start - end - step - 1).div_euclid(-step)
    }
    .max(0);
    if len > i128::from(MAX_RANGE_LEN) {
        return Err(ScriptError::argument("range", "result is too large"));
    }
    (0..len)
        .map(|i| {
            i64::try_from(start + i * step)
                .map(Value::Int)
                .map_err(|_| ScriptError::argument("range", "integer overflow"))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Value::List)
}

fn random(args: &[Value]) -> Result<Value, ScriptError> {
    let mut rng = rand::thread_rng();
    match args {
        [] => Ok(Value::Float(rng.gen::<f64>())),
        [low, high] => {
            let (low, high) = (integer("random", low)?, integer("random", high)?);
            if low > high {
                return Err(ScriptError::argument("random", "empty range"));
            }
            Ok(Value::Int(rng.gen_range(low..=high)))
        }
        _ => Err(ScriptError::argument("random", "takes 0 or 2 arguments")),
    }
}

/// Random delay between two bounds with millisecond resolution
pub fn randomize_delay(args: &[Value]) -> Result<Value, ScriptError> {
    let (mut low, mut high) = match args {
        [low, high] => (number("randomize_delay", low)?, number("randomize_delay", high)?),
        _ => return Err(ScriptError::argument("randomize_delay", "takes 2 arguments")),
    };
    if low <= 0.0 && high <= 0.0 {
        return Ok(Value::Int(0));
    }
    if low > high {
        std::mem::swap(&mut low, &mut high);
    }
    if low == high {
        return Ok(Value::Float(low));
    }
    let millis = rand::thread_rng().gen_range((low * 1000.0) as i64..=(high * 1000.0) as i64);
    Ok(Value::Float(millis as f64 / 1000.0))
}

fn string_method(s: &str, name: &str, args: &[Value]) -> Result<Value, ScriptError> {
    let text_arg = |i: usize| -> Result<&str, ScriptError> {
        match args.get(i) {
            Some(Value::Str(t)) => Ok(t),
            Some(other) => Err(ScriptError::argument(
                name,
                format!("expects a string, got {}", other.type_name()),
            )),
            None => Err(ScriptError::argument(name, "missing argument")),
        }
    };
    match name {
        "split" => {
            let parts: Vec<Value> = if args.is_empty() {
                s.split_whitespace().map(Value::from).collect()
            } else {
                let sep = text_arg(0)?;
                if sep.is_empty() {
                    return Err(ScriptError::argument(name, "empty separator"));
                }
                s.split(sep).map(Value::from).collect()
            };
            Ok(Value::List(parts))
        }
        "starts_with" | "startswith" => Ok(Value::Bool(s.starts_with(text_arg(0)?))),
        "ends_with" | "endswith" => Ok(Value::Bool(s.ends_with(text_arg(0)?))),
        "contains" => Ok(Value::Bool(s.contains(text_arg(0)?))),
        "trim" | "strip" => Ok(Value::from(s.trim())),
        "lower" => Ok(Value::Str(s.to_lowercase())),
        "upper" => Ok(Value::Str(s.to_uppercase())),
        "len" => Ok(Value::Int(s.chars().count() as i64)),
        _ => Err(ScriptError::UnknownAttribute {
            object: "str".to_string(),
            name: name.to_string(),
        }),
    }
}

fn list_method(items: &[Value], name: &str, args: &[Value]) -> Result<Value, ScriptError> {
    match name {
        "len" => Ok(Value::Int(items.len() as i64)),
        "contains" => {
            let needle = one(name, args)?;
            Ok(Value::Bool(items.iter().any(|item| item.loose_eq(needle))))
        }
        _ => Err(ScriptError::UnknownAttribute {
            object: "list".to_string(),
            name: name.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> Value {
        call_function(name, args).unwrap().unwrap()
    }

    #[test]
    fn test_conversions() {
        assert_eq!(call("int", &[Value::from(" 42 ")]), Value::Int(42));
        assert_eq!(call("int", &[Value::Float(3.9)]), Value::Int(3));
        assert_eq!(call("float", &[Value::Int(2)]), Value::Float(2.0));
        assert_eq!(call("str", &[Value::Int(7)]), Value::from("7"));
        assert!(call_function("int", &[Value::from("x")]).unwrap().is_err());
        assert!(call_function("nope", &[]).is_none());
    }

    #[test]
    fn test_min_max() {
        let args = [Value::Int(3), Value::Float(1.5), Value::Int(9)];
        assert_eq!(call("min", &args), Value::Float(1.5));
        assert_eq!(call("max", &[Value::List(args.to_vec())]), Value::Int(9));
        assert!(call_function("max", &[]).unwrap().is_err());
    }

    #[test]
    fn test_range() {
        assert_eq!(
            call("range", &[Value::Int(3)]),
            Value::List(vec![Value::Int(0), Value::Int(1), Value::Int(2)])
        );
        assert_eq!(
            call("range", &[Value::Int(5), Value::Int(0), Value::Int(-2)]),
            Value::List(vec![Value::Int(5), Value::Int(3), Value::Int(1)])
        );
        assert_eq!(
            call("range", &[Value::Int(3), Value::Int(1)]),
            Value::List(vec![])
        );
    }

    #[test]
    fn test_range_at_integer_limits() {
        let too_large = call_function("range", &[Value::Int(i64::MIN), Value::Int(i64::MAX)]).unwrap();
        assert_eq!(
            too_large,
            Err(ScriptError::argument("range", "result is too large"))
        );
        assert_eq!(
            call("range", &[Value::Int(i64::MIN), Value::Int(i64::MAX), Value::Int(i64::MAX)]),
            Value::List(vec![Value::Int(i64::MIN), Value::Int(-1), Value::Int(i64::MAX - 1)])
        );
        assert_eq!(
            call("range", &[Value::Int(i64::MAX), Value::Int(i64::MIN), Value::Int(i64::MIN)]),
            Value::List(vec![Value::Int(i64::MAX), Value::Int(-1)])
        );
    }

    #[test]
    fn test_randomize_delay_bounds() {
        assert_eq!(
            randomize_delay(&[Value::Int(0), Value::Int(-1)]).unwrap(),
            Value::Int(0)
        );
        assert_eq!(
            randomize_delay(&[Value::Float(1.5), Value::Float(1.5)]).unwrap(),
            Value::Float(1.5)
        );
        for _ in 0..50 {
            let delay = randomize_delay(&[Value::Int(2), Value::Int(1)])
                .unwrap()
                .as_f64()
                .unwrap();
            assert!((1.0..=2.0).contains(&delay));
        }
    }

    #[test]
    fn test_random_int_range() {
        for _ in 0..50 {
            let v = call("random", &[Value::Int(-1), Value::Int(1)]);
            assert!(matches!(v, Value::Int(-1..=1)));
        }
    }

    #[test]
    fn test_string_methods() {
        let s = Value::from("at 1 2");
        assert_eq!(
            call_method(&s, "split", &[]).unwrap(),
            Value::List(vec!["at".into(), "1".into(), "2".into()])
        );
        assert_eq!(
            call_method(&s, "startswith", &["at".into()]).unwrap(),
            Value::Bool(true)
        );
        assert!(call_method(&s, "explode", &[]).is_err());
    }

    #[test]
    fn test_list_contains() {
        let list = Value::List(vec![Value::Int(1), Value::from("a")]);
        assert_eq!(
            call_method(&list, "contains", &[Value::Float(1.0)]).unwrap(),
            Value::Bool(true)
        );
    }
}

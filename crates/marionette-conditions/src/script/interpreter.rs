use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use super::ast::{AssignOp, BinaryOp, Expr, Place, Stmt, StmtKind, SuspendOp, UnaryOp};
use super::builtins;
use super::compiler::{BindingKind, CompiledUnit};
use super::value::{Builtin, Value};
use crate::error::ScriptError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Loop iterations between cooperative yields
const YIELD_EVERY: u32 = 64;

/// Everything a running unit can reach outside its own locals
pub trait Host: Send + Sync {
    fn get(&self, object: Builtin, name: &str) -> Result<Value, ScriptError>;

    fn set(&self, object: Builtin, name: &str, value: Value) -> Result<(), ScriptError>;

    fn call_method(
        &self,
        object: Builtin,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, ScriptError>;

    /// Host level functions such as `print`; `None` when `name` is unknown
    fn call_function(&self, name: &str, args: Vec<Value>) -> Option<Result<Value, ScriptError>>;

    /// Run a suspension point to completion
    fn suspend(&self, op: SuspendOp, args: Vec<Value>) -> BoxFuture<'_, Result<Value, ScriptError>>;
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return,
}

/// Tree-walking evaluator for one execution of a compiled unit
pub struct Interpreter<'h> {
    host: &'h dyn Host,
    locals: HashMap<String, Value>,
    iterations: u32,
}

impl<'h> Interpreter<'h> {
    /// Execute `unit` once. Packet units see `packet` bound to the raw text.
    pub async fn run(
        unit: &CompiledUnit,
        host: &'h dyn Host,
        packet: Option<&str>,
    ) -> Result<(), ScriptError> {
        let mut interpreter = Interpreter {
            host,
            locals: HashMap::new(),
            iterations: 0,
        };
        if unit.binding() == BindingKind::Packet {
            interpreter.locals.insert(
                "packet".to_string(),
                Value::Str(packet.unwrap_or_default().to_string()),
            );
        }
        interpreter.exec_block(unit.program()).await.map(|_| ())
    }

    async fn tick(&mut self) {
        self.iterations = self.iterations.wrapping_add(1);
        if self.iterations % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
    }

    fn exec_block<'a>(&'a mut self, stmts: &'a [Stmt]) -> BoxFuture<'a, Result<Flow, ScriptError>> {
        Box::pin(async move {
            for stmt in stmts {
                let flow = self
                    .exec_stmt(stmt)
                    .await
                    .map_err(|e| e.at_line(stmt.line))?;
                if !matches!(flow, Flow::Normal) {
                    return Ok(flow);
                }
            }
            Ok(Flow::Normal)
        })
    }

    async fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Flow, ScriptError> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr).await?;
            }
            StmtKind::Assign { place, op, value } => {
                let value = self.eval(value).await?;
                self.assign(place, *op, value).await?;
            }
            StmtKind::If {
                branches,
                otherwise,
            } => {
                for (cond, body) in branches {
                    if self.eval(cond).await?.truthy() {
                        return self.exec_block(body).await;
                    }
                }
                if let Some(body) = otherwise {
                    return self.exec_block(body).await;
                }
            }
            StmtKind::While { cond, body } => {
                while self.eval(cond).await?.truthy() {
                    self.tick().await;
                    match self.exec_block(body).await? {
                        Flow::Break => break,
                        Flow::Return => return Ok(Flow::Return),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::For { var, iter, body } => {
                let items = match self.eval(iter).await? {
                    Value::List(items) => items,
                    Value::Str(s) => s.chars().map(|c| Value::Str(c.to_string())).collect(),
                    other => {
                        return Err(ScriptError::Type(format!(
                            "{} is not iterable",
                            other.type_name()
                        )))
                    }
                };
                for item in items {
                    self.locals.insert(var.clone(), item);
                    self.tick().await;
                    match self.exec_block(body).await? {
                        Flow::Break => break,
                        Flow::Return => return Ok(Flow::Return),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.eval(value).await?;
                }
                return Ok(Flow::Return);
            }
        }
        Ok(Flow::Normal)
    }

    async fn assign(&mut self, place: &Place, op: AssignOp, value: Value) -> Result<(), ScriptError> {
        match place {
            Place::Var(name) => {
                let value = match op.binary() {
                    Some(bin) => binary(bin, self.lookup(name)?, value)?,
                    None => value,
                };
                self.locals.insert(name.clone(), value);
                Ok(())
            }
            Place::Field(object, field) => match self.eval(object).await? {
                Value::Object(builtin) => {
                    let value = match op.binary() {
                        Some(bin) => binary(bin, self.host.get(builtin, field)?, value)?,
                        None => value,
                    };
                    self.host.set(builtin, field, value)
                }
                other => Err(ScriptError::Type(format!(
                    "cannot set attribute '{}' on {}",
                    field,
                    other.type_name()
                ))),
            },
            Place::Index(object, index) => {
                let Expr::Var(name) = object else {
                    return Err(ScriptError::Type(
                        "only local lists support item assignment".to_string(),
                    ));
                };
                let index = self.eval(index).await?;
                let slot = match self.locals.get_mut(name) {
                    Some(Value::List(items)) => list_slot(items, &index)?,
                    Some(other) => {
                        return Err(ScriptError::Type(format!(
                            "{} does not support item assignment",
                            other.type_name()
                        )))
                    }
                    None => return Err(ScriptError::UndefinedVariable(name.clone())),
                };
                *slot = match op.binary() {
                    Some(bin) => binary(bin, slot.clone(), value)?,
                    None => value,
                };
                Ok(())
            }
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, ScriptError> {
        if let Some(value) = self.locals.get(name) {
            return Ok(value.clone());
        }
        Builtin::from_name(name)
            .map(Value::Object)
            .ok_or_else(|| ScriptError::UndefinedVariable(name.to_string()))
    }

    fn eval<'a>(&'a mut self, expr: &'a Expr) -> BoxFuture<'a, Result<Value, ScriptError>> {
        Box::pin(async move {
            match expr {
                Expr::Nil => Ok(Value::Nil),
                Expr::Bool(b) => Ok(Value::Bool(*b)),
                Expr::Int(i) => Ok(Value::Int(*i)),
                Expr::Float(f) => Ok(Value::Float(*f)),
                Expr::Str(s) => Ok(Value::Str(s.clone())),
                Expr::List(items) => Ok(Value::List(self.eval_args(items).await?)),
                Expr::Var(name) => self.lookup(name),
                Expr::Field(object, name) => match self.eval(object).await? {
                    Value::Object(builtin) => self.host.get(builtin, name),
                    other => Err(ScriptError::UnknownAttribute {
                        object: other.type_name().to_string(),
                        name: name.clone(),
                    }),
                },
                Expr::Index(object, index) => {
                    let object = self.eval(object).await?;
                    let index = self.eval(index).await?;
                    index_value(object, &index)
                }
                Expr::Call { callee, args } => self.call(callee, args).await,
                Expr::Unary(op, operand) => {
                    let value = self.eval(operand).await?;
                    unary(*op, value)
                }
                Expr::Binary(BinaryOp::And, lhs, rhs) => {
                    let lhs = self.eval(lhs).await?;
                    if !lhs.truthy() {
                        return Ok(lhs);
                    }
                    self.eval(rhs).await
                }
                Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                    let lhs = self.eval(lhs).await?;
                    if lhs.truthy() {
                        return Ok(lhs);
                    }
                    self.eval(rhs).await
                }
                Expr::Binary(op, lhs, rhs) => {
                    let lhs = self.eval(lhs).await?;
                    let rhs = self.eval(rhs).await?;
                    binary(*op, lhs, rhs)
                }
                Expr::Suspend(op, args) => {
                    let args = self.eval_args(args).await?;
                    self.host.suspend(*op, args).await
                }
            }
        })
    }

    async fn eval_args(&mut self, args: &[Expr]) -> Result<Vec<Value>, ScriptError> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg).await?);
        }
        Ok(values)
    }

    async fn call(&mut self, callee: &Expr, args: &[Expr]) -> Result<Value, ScriptError> {
        match callee {
            Expr::Var(name) if !self.locals.contains_key(name) => {
                let args = self.eval_args(args).await?;
                if let Some(result) = builtins::call_function(name, &args) {
                    return result;
                }
                self.host
                    .call_function(name, args)
                    .unwrap_or_else(|| Err(ScriptError::UnknownFunction(name.clone())))
            }
            Expr::Field(object, method) => {
                let receiver = self.eval(object).await?;
                let args = self.eval_args(args).await?;
                match receiver {
                    Value::Object(builtin) => self.host.call_method(builtin, method, args),
                    other => builtins::call_method(&other, method, &args),
                }
            }
            _ => {
                let value = self.eval(callee).await?;
                Err(ScriptError::Type(format!(
                    "{} is not callable",
                    value.type_name()
                )))
            }
        }
    }
}

fn list_slot<'v>(items: &'v mut [Value], index: &Value) -> Result<&'v mut Value, ScriptError> {
    let len = items.len();
    let position = resolve_index(index, len)?;
    Ok(&mut items[position])
}

fn resolve_index(index: &Value, len: usize) -> Result<usize, ScriptError> {
    let raw = index
        .as_i64()
        .ok_or_else(|| ScriptError::Type(format!("indices must be int, not {}", index.type_name())))?;
    let position = if raw < 0 { raw + len as i64 } else { raw };
    if position < 0 || position >= len as i64 {
        return Err(ScriptError::IndexOutOfRange { index: raw, len });
    }
    Ok(position as usize)
}

fn index_value(object: Value, index: &Value) -> Result<Value, ScriptError> {
    match object {
        Value::List(mut items) => {
            let position = resolve_index(index, items.len())?;
            Ok(items.swap_remove(position))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let position = resolve_index(index, chars.len())?;
            Ok(Value::Str(chars[position].to_string()))
        }
        other => Err(ScriptError::Type(format!(
            "{} is not subscriptable",
            other.type_name()
        ))),
    }
}

fn unary(op: UnaryOp, value: Value) -> Result<Value, ScriptError> {
    match (op, value) {
        (UnaryOp::Not, value) => Ok(Value::Bool(!value.truthy())),
        (UnaryOp::Neg, Value::Int(i)) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| ScriptError::Type("integer overflow".to_string())),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, other) => Err(ScriptError::Type(format!(
            "bad operand type for unary -: {}",
            other.type_name()
        ))),
    }
}

fn overflow() -> ScriptError {
    ScriptError::Type("integer overflow".to_string())
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, ScriptError> {
    use Value::{Float, Int, List, Str};

    let unsupported = |lhs: &Value, rhs: &Value, symbol: &str| {
        ScriptError::Type(format!(
            "unsupported operand types for {}: {} and {}",
            symbol,
            lhs.type_name(),
            rhs.type_name()
        ))
    };

    match op {
        BinaryOp::Eq => Ok(Value::Bool(lhs.loose_eq(&rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!lhs.loose_eq(&rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = lhs.compare(&rhs).ok_or_else(|| unsupported(&lhs, &rhs, "comparison"))?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::Add => match (lhs, rhs) {
            (Int(a), Int(b)) => a.checked_add(b).map(Int).ok_or_else(overflow),
            (Str(a), Str(b)) => Ok(Str(a + &b)),
            (List(mut a), List(b)) => {
                a.extend(b);
                Ok(List(a))
            }
            (a, b) => numeric(&a, &b, "+").map(|(x, y)| Float(x + y)),
        },
        BinaryOp::Sub => match (lhs, rhs) {
            (Int(a), Int(b)) => a.checked_sub(b).map(Int).ok_or_else(overflow),
            (a, b) => numeric(&a, &b, "-").map(|(x, y)| Float(x - y)),
        },
        BinaryOp::Mul => match (lhs, rhs) {
            (Int(a), Int(b)) => a.checked_mul(b).map(Int).ok_or_else(overflow),
            (a, b) => numeric(&a, &b, "*").map(|(x, y)| Float(x * y)),
        },
        BinaryOp::Div => {
            let (x, y) = numeric(&lhs, &rhs, "/")?;
            if y == 0.0 {
                return Err(ScriptError::DivisionByZero);
            }
            Ok(Float(x / y))
        }
        BinaryOp::Rem => match (lhs, rhs) {
            (Int(_), Int(0)) => Err(ScriptError::DivisionByZero),
            (Int(a), Int(b)) => {
                // Result takes the sign of the divisor
                let r = a.checked_rem(b).ok_or_else(overflow)?;
                Ok(Int(if r != 0 && (r < 0) != (b < 0) { r + b } else { r }))
            }
            (a, b) => {
                let (x, y) = numeric(&a, &b, "%")?;
                if y == 0.0 {
                    return Err(ScriptError::DivisionByZero);
                }
                Ok(Float(x - y * (x / y).floor()))
            }
        },
        BinaryOp::And | BinaryOp::Or => {
            // Short-circuited in `eval`; reached only through compound assignment
            Err(unsupported(&lhs, &rhs, "logical assignment"))
        }
    }
}

fn numeric(lhs: &Value, rhs: &Value, symbol: &str) -> Result<(f64, f64), ScriptError> {
    match (lhs, rhs) {
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            Ok((lhs.as_f64().unwrap_or_default(), rhs.as_f64().unwrap_or_default()))
        }
        _ => Err(ScriptError::Type(format!(
            "unsupported operand types for {}: {} and {}",
            symbol,
            lhs.type_name(),
            rhs.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::compiler::Compiler;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHost {
        printed: Mutex<Vec<String>>,
        suspended: Mutex<Vec<(SuspendOp, Vec<Value>)>>,
        attrs: Mutex<HashMap<String, Value>>,
    }

    impl Host for RecordingHost {
        fn get(&self, object: Builtin, name: &str) -> Result<Value, ScriptError> {
            match object {
                Builtin::Attrs => Ok(self
                    .attrs
                    .lock()
                    .unwrap()
                    .get(name)
                    .cloned()
                    .unwrap_or(Value::Int(0))),
                Builtin::Player if name == "hp" => Ok(Value::Int(40)),
                _ => Err(ScriptError::UnknownAttribute {
                    object: object.name().to_string(),
                    name: name.to_string(),
                }),
            }
        }

        fn set(&self, object: Builtin, name: &str, value: Value) -> Result<(), ScriptError> {
            match object {
                Builtin::Attrs => {
                    self.attrs.lock().unwrap().insert(name.to_string(), value);
                    Ok(())
                }
                _ => Err(ScriptError::Access {
                    object: object.name().to_string(),
                    name: name.to_string(),
                    access: "read-only",
                }),
            }
        }

        fn call_method(
            &self,
            object: Builtin,
            name: &str,
            _args: Vec<Value>,
        ) -> Result<Value, ScriptError> {
            Err(ScriptError::UnknownAttribute {
                object: object.name().to_string(),
                name: name.to_string(),
            })
        }

        fn call_function(&self, name: &str, args: Vec<Value>) -> Option<Result<Value, ScriptError>> {
            match name {
                "print" => {
                    let line = args
                        .iter()
                        .map(Value::to_string)
                        .collect::<Vec<_>>()
                        .join(" ");
                    self.printed.lock().unwrap().push(line);
                    Some(Ok(Value::Nil))
                }
                _ => None,
            }
        }

        fn suspend(&self, op: SuspendOp, args: Vec<Value>) -> BoxFuture<'_, Result<Value, ScriptError>> {
            Box::pin(async move {
                self.suspended.lock().unwrap().push((op, args));
                tokio::task::yield_now().await;
                Ok(Value::Bool(true))
            })
        }
    }

    async fn run(source: &str, packet: Option<&str>) -> (RecordingHost, Result<(), ScriptError>) {
        let binding = if packet.is_some() {
            BindingKind::Packet
        } else {
            BindingKind::Periodic
        };
        let unit = Compiler::new().compile(source, binding).unwrap();
        let host = RecordingHost::default();
        let result = Interpreter::run(&unit, &host, packet).await;
        (host, result)
    }

    fn printed(host: &RecordingHost) -> Vec<String> {
        host.printed.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_arithmetic_and_strings() {
        let (host, result) = run(
            "x = 7; y = 2;\nprint(x + y, x - y, x * y, x / y, x % y, -7 % 3);\nprint(\"walk \" + str(x));",
            None,
        )
        .await;
        result.unwrap();
        assert_eq!(printed(&host), vec!["9 5 14 3.5 1 2", "walk 7"]);
    }

    #[tokio::test]
    async fn test_remainder_follows_divisor_sign() {
        let (host, result) = run("print(7 % -3, -7 % -3, 6 % -3);", None).await;
        result.unwrap();
        assert_eq!(printed(&host), vec!["-2 -1 0"]);
    }

    #[tokio::test]
    async fn test_remainder_overflow_is_an_error() {
        let (_, result) = run("x = 1;
x = (-9223372036854775807 - 1) % -1;", None).await;
        let err = result.unwrap_err();
        assert_eq!(err.line(), Some(2));
        assert_eq!(err, overflow().at_line(2));
    }

    #[tokio::test]
    async fn test_packet_binding() {
        let (host, result) = run(
            "parts = packet.split();\nif parts[0] == \"at\" and int(parts[3]) > 10 { print(parts[-1]); }",
            Some("at 1 2 30 40"),
        )
        .await;
        result.unwrap();
        assert_eq!(printed(&host), vec!["40"]);
    }

    #[tokio::test]
    async fn test_periodic_has_no_packet() {
        let (_, result) = run("print(packet);", None).await;
        assert_eq!(
            result.unwrap_err(),
            ScriptError::UndefinedVariable("packet".to_string()).at_line(1)
        );
    }

    #[tokio::test]
    async fn test_loops_and_control_flow() {
        let (host, result) = run(
            "total = 0;\nfor i in range(10) {\n  if i % 2 == 0 { continue; }\n  if i > 7 { break; }\n  total += i;\n}\nn = 0;\nwhile true { n += 1; if n == 3 { break; } }\nprint(total, n);\nreturn;\nprint(\"unreachable\");",
            None,
        )
        .await;
        result.unwrap();
        assert_eq!(printed(&host), vec!["16 3"]);
    }

    #[tokio::test]
    async fn test_builtin_objects() {
        let (host, result) = run(
            "attrs.attr1 += 5;\nattrs.attr1 *= 2;\nprint(attrs.attr1, attrs.attr2, player.hp);",
            None,
        )
        .await;
        result.unwrap();
        assert_eq!(printed(&host), vec!["10 0 40"]);
    }

    #[tokio::test]
    async fn test_suspension_points_reach_host() {
        let (host, result) = run(
            "time.sleep(0.5);\nif walk_to(3, 4) { print(\"arrived\"); }",
            None,
        )
        .await;
        result.unwrap();
        let suspended = host.suspended.lock().unwrap().clone();
        assert_eq!(
            suspended,
            vec![
                (SuspendOp::Sleep, vec![Value::Float(0.5)]),
                (SuspendOp::WalkTo, vec![Value::Int(3), Value::Int(4)]),
            ]
        );
        assert_eq!(printed(&host), vec!["arrived"]);
    }

    #[tokio::test]
    async fn test_runtime_error_carries_line() {
        let (_, result) = run("x = 1;\n\ny = x / 0;", None).await;
        let err = result.unwrap_err();
        assert_eq!(err.line(), Some(3));
        assert_eq!(err.to_string(), "line 3: division by zero");
    }

    #[tokio::test]
    async fn test_nested_error_reports_inner_line() {
        let (_, result) = run("if true {\n  while true {\n    missing();\n  }\n}", None).await;
        assert_eq!(result.unwrap_err().line(), Some(3));
    }

    #[tokio::test]
    async fn test_short_circuit() {
        let (host, result) = run("x = nil;\nif x != nil and x.y { print(1); } else { print(2); }", None).await;
        result.unwrap();
        assert_eq!(printed(&host), vec!["2"]);
    }

    #[tokio::test]
    async fn test_list_item_assignment() {
        let (host, result) = run("l = [1, 2, 3];\nl[1] = 9;\nl[-1] += 1;\nprint(l);", None).await;
        result.unwrap();
        assert_eq!(printed(&host), vec!["[1, 9, 4]"]);
    }

    #[tokio::test]
    async fn test_read_only_objects() {
        let (_, result) = run("player.hp = 1;", None).await;
        assert!(matches!(
            result.unwrap_err(),
            ScriptError::AtLine { error, .. } if matches!(*error, ScriptError::Access { .. })
        ));
    }
}

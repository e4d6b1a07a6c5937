//! What a running condition sees of the outside world.

use std::sync::Arc;
use std::time::Duration;

use marionette_client::{EntityState, Position};
use marionette_events::{ConditionKind, QueryKind};
use tracing::{info, warn};

use crate::control::ControlOp;
use crate::engine::{lock, EngineCore};
use crate::error::{ScriptError, SubgroupError};
use crate::registry::{Condition, ConditionId};
use crate::script::{BoxFuture, Builtin, Host, SuspendOp, Value};
use crate::walk::WalkParams;

/// The condition a unit is executing for, passed explicitly to every host call
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub id: ConditionId,
    pub kind: ConditionKind,
    pub name: String,
}

impl From<&Condition> for ExecutionContext {
    fn from(condition: &Condition) -> Self {
        Self {
            id: condition.id,
            kind: condition.kind,
            name: condition.name.clone(),
        }
    }
}

pub(crate) struct ExecutionHost {
    core: Arc<EngineCore>,
    ctx: ExecutionContext,
}

fn optional<T: Into<Value>>(value: Option<T>) -> Value {
    value.map(Into::into).unwrap_or(Value::Nil)
}

fn player_field(state: &EntityState, name: &str) -> Option<Value> {
    let value = match name {
        "id" => optional(state.id),
        "name" => optional(state.name.clone()),
        "x" => Value::Int(state.x.into()),
        "y" => Value::Int(state.y.into()),
        "map_id" => Value::Int(state.map_id.into()),
        "map_epoch" => Value::Int(state.map_epoch as i64),
        "level" => Value::Int(state.level),
        "hp" => Value::Int(state.hp),
        "max_hp" => Value::Int(state.max_hp),
        "hp_percent" => Value::Int(state.hp_percent),
        "mp" => Value::Int(state.mp),
        "max_mp" => Value::Int(state.max_mp),
        "mp_percent" => Value::Int(state.mp_percent),
        "gold" => Value::Int(state.gold),
        "leader_id" => optional(state.leader_id),
        "subgroup_index" => optional(state.subgroup_index),
        "can_attack" => Value::Bool(state.can_attack),
        "can_move" => Value::Bool(state.can_move),
        "speed" => Value::Int(state.speed),
        _ => return None,
    };
    Some(value)
}

fn subgroup_error(error: SubgroupError) -> ScriptError {
    ScriptError::Host(error.to_string())
}

fn unknown(object: Builtin, name: &str) -> ScriptError {
    ScriptError::UnknownAttribute {
        object: object.name().to_string(),
        name: name.to_string(),
    }
}

fn access(object: Builtin, name: &str, access: &'static str) -> ScriptError {
    ScriptError::Access {
        object: object.name().to_string(),
        name: name.to_string(),
        access,
    }
}

fn int_arg(function: &str, value: &Value) -> Result<i64, ScriptError> {
    value
        .as_i64()
        .ok_or_else(|| ScriptError::argument(function, format!("expected int, got {}", value.type_name())))
}

fn float_arg(function: &str, value: &Value) -> Result<f64, ScriptError> {
    value
        .as_f64()
        .ok_or_else(|| ScriptError::argument(function, format!("expected number, got {}", value.type_name())))
}

/// Seconds from a script, clamped to a valid `Duration`
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

fn coordinate(function: &str, value: &Value) -> Result<i32, ScriptError> {
    i32::try_from(int_arg(function, value)?)
        .map_err(|_| ScriptError::argument(function, "coordinate out of range"))
}

/// Split `x, y, rest..` or `[x, y], rest..` into a position and the rest
fn target<'a>(function: &str, args: &'a [Value]) -> Result<(Position, &'a [Value]), ScriptError> {
    match args {
        [Value::List(point), rest @ ..] => match point.as_slice() {
            [x, y] => Ok((Position::new(coordinate(function, x)?, coordinate(function, y)?), rest)),
            _ => Err(ScriptError::argument(function, "point must be [x, y]")),
        },
        [x, y, rest @ ..] => Ok((Position::new(coordinate(function, x)?, coordinate(function, y)?), rest)),
        _ => Err(ScriptError::argument(function, "expects x and y")),
    }
}

fn kind_arg(function: &str, value: &Value) -> Result<ConditionKind, ScriptError> {
    match value {
        Value::Str(tag) => ConditionKind::from_tag(tag)
            .ok_or_else(|| ScriptError::argument(function, format!("unknown condition kind '{}'", tag))),
        other => Err(ScriptError::argument(
            function,
            format!("expected kind tag, got {}", other.type_name()),
        )),
    }
}

fn display_args(args: &[Value]) -> String {
    args.iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

impl ExecutionHost {
    pub(crate) fn new(core: Arc<EngineCore>, ctx: ExecutionContext) -> Self {
        Self { core, ctx }
    }

    fn control(&self, op: ControlOp, value: &Value) {
        if let Err(e) = self.core.control(op, value, Some(self.ctx.id)) {
            warn!(
                target: "conditions",
                entity = %self.core.name,
                condition = %self.ctx.name,
                "cond.{} = {}: {}",
                if op == ControlOp::On { "on" } else { "off" },
                value,
                e
            );
        }
    }

    fn elapsed_secs(&self, target: Option<(ConditionKind, &str)>) -> Value {
        lock(&self.core.clock)
            .elapsed(target)
            .map(|d| Value::Float(d.as_secs_f64()))
            .unwrap_or(Value::Nil)
    }

    async fn sleep(&self, args: &[Value]) -> Result<Value, ScriptError> {
        let secs = match args {
            [secs] => float_arg("sleep", secs)?,
            _ => return Err(ScriptError::argument("sleep", "takes 1 argument")),
        };
        if secs > 0.0 {
            tokio::time::sleep(seconds(secs)).await;
        } else {
            tokio::task::yield_now().await;
        }
        Ok(Value::Nil)
    }

    async fn walk_to(&self, args: &[Value]) -> Result<Value, ScriptError> {
        let (position, rest) = target("walk_to", args)?;
        let mut params = WalkParams::new(position, self.core.walker.config());
        if let Some(radius) = rest.first() {
            params.radius = i32::try_from(int_arg("walk_to", radius)?.max(0)).unwrap_or(i32::MAX);
        }
        if let Some(with_companion) = rest.get(1) {
            params.with_companion = with_companion.truthy();
        }
        if let Some(stride) = rest.get(2) {
            params.stride = usize::try_from(int_arg("walk_to", stride)?).unwrap_or(0).max(1);
        }
        if let Some(timeout) = rest.get(3) {
            params.timeout = seconds(float_arg("walk_to", timeout)?);
        }
        if let Some(proximity) = rest.get(4) {
            params.proximity = float_arg("walk_to", proximity)?;
        }
        if rest.len() > 5 {
            return Err(ScriptError::argument("walk_to", "takes at most 7 arguments"));
        }

        let initiator = (self.ctx.kind == ConditionKind::Periodic).then_some(self.ctx.id);
        let outcome = self.core.walker.walk_to(initiator, params).await;
        Ok(Value::Bool(outcome.is_success()))
    }

    async fn walk_to_map(&self, args: &[Value]) -> Result<Value, ScriptError> {
        let (position, rest) = target("walk_to_map", args)?;
        let with_companion = match rest {
            [] => true,
            [flag] => flag.truthy(),
            _ => return Err(ScriptError::argument("walk_to_map", "takes at most 3 arguments")),
        };
        let changed = self
            .core
            .walker
            .walk_and_await_map_change(position, with_companion)
            .await;
        Ok(Value::Bool(changed))
    }

    /// `queries(delay, player_info, inventory, skills, entities)`
    async fn queries(&self, args: &[Value]) -> Result<Value, ScriptError> {
        if args.len() > 5 {
            return Err(ScriptError::argument("queries", "takes at most 5 arguments"));
        }
        let delay = match args.first() {
            Some(delay) => float_arg("queries", delay)?.max(0.0),
            None => 1.0,
        };
        let flag = |i: usize| args.get(i).map_or(true, Value::truthy);
        let selected = [
            (QueryKind::PlayerInfo, flag(1)),
            (QueryKind::Inventory, flag(2)),
            (QueryKind::Skills, flag(3)),
            (QueryKind::MapEntities, flag(4)),
        ];
        let pause = seconds(delay);

        tokio::time::sleep(pause).await;
        for (kind, _) in selected.into_iter().filter(|(_, on)| *on) {
            let api = Arc::clone(&self.core.api);
            match self.core.blocking.run(move || api.query(kind)).await {
                Some(Ok(())) => {}
                Some(Err(e)) => return Err(ScriptError::Host(format!("{} query failed: {}", kind.name(), e))),
                None => return Err(ScriptError::Host(format!("{} query panicked", kind.name()))),
            }
            if kind != QueryKind::MapEntities {
                tokio::time::sleep(pause).await;
            }
        }
        Ok(Value::Nil)
    }
}

impl Host for ExecutionHost {
    fn get(&self, object: Builtin, name: &str) -> Result<Value, ScriptError> {
        match object {
            Builtin::Player => self
                .core
                .state
                .read(|state| player_field(state, name))
                .ok_or_else(|| unknown(object, name)),
            Builtin::Group => Ok(self.core.group.get(name, Value::Nil)),
            Builtin::Subgroup => self
                .core
                .group
                .subgroup_get(name, 0)
                .map(Value::Int)
                .map_err(subgroup_error),
            Builtin::Cond => match ControlOp::from_property(name) {
                Some(_) => Err(access(object, name, "write-only")),
                None => Err(unknown(object, name)),
            },
            Builtin::Attrs => Ok(lock(&self.core.attrs)
                .get(name)
                .cloned()
                .unwrap_or(Value::Int(0))),
            Builtin::Time => match name {
                "cond" => Ok(self.elapsed_secs(None)),
                _ => Err(unknown(object, name)),
            },
        }
    }

    fn set(&self, object: Builtin, name: &str, value: Value) -> Result<(), ScriptError> {
        match object {
            Builtin::Player => match name {
                "leader_id" => {
                    let leader = match value {
                        Value::Nil => None,
                        other => Some(int_arg("leader_id", &other)?),
                    };
                    self.core.state.set_leader_id(leader);
                    Ok(())
                }
                "subgroup_index" => {
                    let index = match value {
                        Value::Nil => None,
                        other => Some(int_arg("subgroup_index", &other)?),
                    };
                    self.core.state.set_subgroup_index(index);
                    Ok(())
                }
                _ if self.core.state.read(|s| player_field(s, name)).is_some() => {
                    Err(access(object, name, "read-only"))
                }
                _ => Err(unknown(object, name)),
            },
            Builtin::Group => {
                self.core.group.set(name, value);
                Ok(())
            }
            Builtin::Subgroup => self
                .core
                .group
                .subgroup_set(name, &value)
                .map_err(subgroup_error),
            Builtin::Cond => match ControlOp::from_property(name) {
                Some(op) => {
                    self.control(op, &value);
                    Ok(())
                }
                None => Err(unknown(object, name)),
            },
            Builtin::Attrs => {
                lock(&self.core.attrs).insert(name.to_string(), value);
                Ok(())
            }
            Builtin::Time => Err(access(object, name, "read-only")),
        }
    }

    fn call_method(&self, object: Builtin, name: &str, args: Vec<Value>) -> Result<Value, ScriptError> {
        match (object, name) {
            (Builtin::Group, "get") => match args.as_slice() {
                [Value::Str(key)] => Ok(self.core.group.get(key, Value::Nil)),
                [Value::Str(key), default] => Ok(self.core.group.get(key, default.clone())),
                _ => Err(ScriptError::argument("group.get", "expects a name and optional default")),
            },
            (Builtin::Group, "set") => match <[Value; 2]>::try_from(args) {
                Ok([Value::Str(key), value]) => {
                    self.core.group.set(&key, value);
                    Ok(Value::Nil)
                }
                _ => Err(ScriptError::argument("group.set", "expects a name and a value")),
            },
            (Builtin::Group, "delete") => match args.as_slice() {
                [Value::Str(key)] => Ok(Value::Bool(self.core.group.delete(key))),
                _ => Err(ScriptError::argument("group.delete", "expects a name")),
            },
            (Builtin::Subgroup, "get") => {
                let (key, default) = match args.as_slice() {
                    [Value::Str(key)] => (key, 0),
                    [Value::Str(key), default] => (key, int_arg("subgroup.get", default)?),
                    _ => {
                        return Err(ScriptError::argument(
                            "subgroup.get",
                            "expects a name and optional default",
                        ))
                    }
                };
                let group = &self.core.group;
                group.subgroup_get(key, default).map(Value::Int).map_err(subgroup_error)
            }
            (Builtin::Subgroup, "set") => match args.as_slice() {
                [Value::Str(key), value] => self
                    .core
                    .group
                    .subgroup_set(key, value)
                    .map(|_| Value::Nil)
                    .map_err(subgroup_error),
                _ => Err(ScriptError::argument("subgroup.set", "expects a name and a value")),
            },
            (Builtin::Subgroup, "delete") => match args.as_slice() {
                [Value::Str(key)] => self
                    .core
                    .group
                    .subgroup_delete(key)
                    .map(Value::Bool)
                    .map_err(subgroup_error),
                _ => Err(ScriptError::argument("subgroup.delete", "expects a name")),
            },
            (Builtin::Attrs, "reset") => {
                lock(&self.core.attrs).clear();
                Ok(Value::Nil)
            }
            (Builtin::Attrs, "get") => match args.as_slice() {
                [Value::Str(key)] => Ok(lock(&self.core.attrs).get(key).cloned().unwrap_or(Value::Int(0))),
                [Value::Str(key), default] => {
                    Ok(lock(&self.core.attrs).get(key).cloned().unwrap_or_else(|| default.clone()))
                }
                _ => Err(ScriptError::argument("attrs.get", "expects a name and optional default")),
            },
            (Builtin::Time, "time") => {
                let now = chrono::Utc::now();
                Ok(Value::Float(now.timestamp_millis() as f64 / 1000.0))
            }
            (Builtin::Time, "cond_of") => match args.as_slice() {
                [kind, Value::Str(name)] => {
                    let kind = kind_arg("time.cond_of", kind)?;
                    Ok(self.elapsed_secs(Some((kind, name))))
                }
                _ => Err(ScriptError::argument("time.cond_of", "expects a kind and a name")),
            },
            (Builtin::Time, "reset_cond") => {
                let mut clock = lock(&self.core.clock);
                match args.as_slice() {
                    [] => clock.reset(None),
                    [kind, Value::Str(name)] => {
                        clock.reset(Some((kind_arg("time.reset_cond", kind)?, name)))
                    }
                    _ => {
                        return Err(ScriptError::argument(
                            "time.reset_cond",
                            "expects no arguments or a kind and a name",
                        ))
                    }
                }
                Ok(Value::Nil)
            }
            _ => Err(unknown(object, name)),
        }
    }

    fn call_function(&self, name: &str, args: Vec<Value>) -> Option<Result<Value, ScriptError>> {
        let result = match name {
            "print" | "log" => {
                info!(
                    target: "script",
                    entity = %self.core.name,
                    condition = %self.ctx.name,
                    "{}",
                    display_args(&args)
                );
                Ok(Value::Nil)
            }
            "send_packet" | "recv_packet" => match args.as_slice() {
                [Value::Str(packet)] => {
                    let sent = if name == "send_packet" {
                        self.core.api.send_packet(packet)
                    } else {
                        self.core.api.recv_packet(packet)
                    };
                    sent.map(|_| Value::Nil)
                        .map_err(|e| ScriptError::Host(format!("{}: {}", name, e)))
                }
                _ => Err(ScriptError::argument(name, "expects a packet string")),
            },
            _ => return None,
        };
        Some(result)
    }

    fn suspend(&self, op: SuspendOp, args: Vec<Value>) -> BoxFuture<'_, Result<Value, ScriptError>> {
        Box::pin(async move {
            match op {
                SuspendOp::Sleep => self.sleep(&args).await,
                SuspendOp::WalkTo => self.walk_to(&args).await,
                SuspendOp::WalkToMap => self.walk_to_map(&args).await,
                SuspendOp::Queries => self.queries(&args).await,
            }
        })
    }
}

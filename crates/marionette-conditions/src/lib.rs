//! Condition automation engine.
//!
//! Conditions are small scripts bound to a trigger: an inbound packet, an
//! outbound packet, or a periodic timer. Each controlled entity gets a
//! [`ConditionEngine`] that compiles, schedules and supervises them.

pub mod blocking;
pub mod cache;
pub mod control;
mod dispatcher;
pub mod engine;
pub mod error;
pub mod group;
pub mod host;
pub mod persist;
pub mod registry;
pub mod scheduler;
pub mod script;
pub mod walk;

pub use control::{ActivityClock, ControlOp, Toggle};
pub use engine::{ConditionEngine, ConditionEngineBuilder};
pub use error::{
    BuildError, CompileError, ConditionFileError, ControlError, EngineError, RegistryError,
    ScriptError, SubgroupError,
};
pub use group::{GroupId, GroupNamespace, GroupStore};
pub use host::ExecutionContext;
pub use persist::{ConditionFile, NamedCondition};
pub use registry::{natural_cmp, Condition, ConditionId, ConditionRegistry, SequenceEntry};
pub use script::{Compiler, Value};
pub use walk::{WalkCoordinator, WalkOutcome, WalkParams};

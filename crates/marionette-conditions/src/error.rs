use std::path::PathBuf;

use marionette_events::ConditionKind;

/// Malformed condition source
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("syntax error at line {line}, column {column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },
    #[error("line {line}: `{keyword}` outside of a loop")]
    MisplacedControl { line: usize, keyword: &'static str },
    #[error("unexpected grammar shape: {0}")]
    Shape(&'static str),
}

impl CompileError {
    pub fn line(&self) -> Option<usize> {
        match self {
            CompileError::Syntax { line, .. } | CompileError::MisplacedControl { line, .. } => {
                Some(*line)
            }
            CompileError::Shape(_) => None,
        }
    }
}

/// Failure raised while a compiled unit runs
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScriptError {
    #[error("name '{0}' is not defined")]
    UndefinedVariable(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("'{object}' has no attribute '{name}'")]
    UnknownAttribute { object: String, name: String },
    #[error("'{object}.{name}' is {access}")]
    Access {
        object: String,
        name: String,
        access: &'static str,
    },
    #[error("type error: {0}")]
    Type(String),
    #[error("{function}() {message}")]
    Argument {
        function: String,
        message: String,
    },
    #[error("division by zero")]
    DivisionByZero,
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("{0}")]
    Host(String),
    #[error("line {line}: {error}")]
    AtLine { line: usize, error: Box<ScriptError> },
}

impl ScriptError {
    pub fn argument(function: &str, message: impl Into<String>) -> Self {
        ScriptError::Argument {
            function: function.to_string(),
            message: message.into(),
        }
    }

    pub fn at_line(self, line: usize) -> Self {
        match self {
            located @ ScriptError::AtLine { .. } => located,
            error => ScriptError::AtLine {
                line,
                error: Box::new(error),
            },
        }
    }

    pub fn line(&self) -> Option<usize> {
        match self {
            ScriptError::AtLine { line, .. } => Some(*line),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("a {kind} condition named '{name}' already exists")]
    DuplicateName { kind: ConditionKind, name: String },
    #[error("no {kind} condition at index {index} (have {len})")]
    IndexOutOfRange {
        kind: ConditionKind,
        index: usize,
        len: usize,
    },
    #[error("no {kind} condition named '{name}'")]
    UnknownName { kind: ConditionKind, name: String },
}

/// Subgroup variable access by an entity outside any subgroup
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubgroupError {
    #[error("subgroup variables need a known group leader")]
    NoGroup,
    #[error("the entity does not belong to a subgroup")]
    NoSubgroup,
    #[error("subgroup variables accept only integers, got {0}")]
    NotAnInteger(String),
}

/// Invalid `cond.on` / `cond.off` use; reported, never fatal
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("condition numbers must be integers, got {0}")]
    NotAnInteger(&'static str),
    #[error("condition numbers start at 1")]
    StartsAtOne,
    #[error("no conditions available to toggle")]
    NoConditions,
    #[error("condition index {index} is out of range (max {max})")]
    OutOfRange { index: i64, max: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum ConditionFileError {
    #[error("condition file is missing its kind tag")]
    MissingKind,
    #[error("unknown condition kind tag '{0}'")]
    UnknownKind(String),
    #[error("condition file is missing its active flag")]
    MissingFlag,
    #[error("active flag must be 1 or 0, got '{0}'")]
    InvalidFlag(String),
    #[error("'{0}' cannot be used as a condition file name")]
    InvalidName(String),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<ConditionFileError>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to compile {kind} condition '{name}': {source}")]
    Compile {
        kind: ConditionKind,
        name: String,
        #[source]
        source: CompileError,
    },
    #[error(transparent)]
    File(#[from] ConditionFileError),
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no game api configured - use .with_api()")]
    MissingApi,
    #[error("no pathfinder configured - use .with_pathfinder()")]
    MissingPathfinder,
    #[error("no map loader configured - use .with_map_loader()")]
    MissingMapLoader,
    #[error("no tokio runtime available - use .with_runtime()")]
    MissingRuntime,
}

//! Line-oriented text format for a single condition.
//!
//! ```text
//! recv_packet      <- kind tag: recv_packet | send_packet | periodical
//! 1                <- active flag: 1 | 0
//! ...source...     <- everything after the second line, verbatim
//! ```

use std::path::{Path, PathBuf};

use marionette_events::ConditionKind;
use tracing::debug;

use crate::error::ConditionFileError;
use crate::registry::natural_cmp;

/// Extension of condition files inside a conditions directory
pub const CONDITION_EXTENSION: &str = "txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionFile {
    pub kind: ConditionKind,
    pub active: bool,
    pub source: String,
}

/// A condition file together with the name taken from its file stem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedCondition {
    pub name: String,
    pub file: ConditionFile,
}

impl ConditionFile {
    pub fn new(kind: ConditionKind, active: bool, source: impl Into<String>) -> Self {
        Self {
            kind,
            active,
            source: source.into(),
        }
    }

    pub fn encode(&self) -> String {
        let flag = if self.active { "1" } else { "0" };
        format!("{}\n{}\n{}", self.kind.tag(), flag, self.source)
    }

    pub fn decode(text: &str) -> Result<Self, ConditionFileError> {
        let (tag, rest) = split_line(text);
        let tag = tag.ok_or(ConditionFileError::MissingKind)?;
        let kind = ConditionKind::from_tag(tag)
            .ok_or_else(|| ConditionFileError::UnknownKind(tag.to_string()))?;

        let (flag, source) = split_line(rest);
        let active = match flag.ok_or(ConditionFileError::MissingFlag)? {
            "1" => true,
            "0" => false,
            other => return Err(ConditionFileError::InvalidFlag(other.to_string())),
        };

        Ok(Self {
            kind,
            active,
            source: source.to_string(),
        })
    }
}

/// Split off one header line, tolerating a `\r\n` ending
fn split_line(text: &str) -> (Option<&str>, &str) {
    let (line, rest) = match text.split_once('\n') {
        Some((line, rest)) => (line, rest),
        None => (text, ""),
    };
    let line = line.strip_suffix('\r').unwrap_or(line);
    ((!line.is_empty()).then_some(line), rest)
}

pub fn read_file(path: &Path) -> Result<NamedCondition, ConditionFileError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConditionFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file = ConditionFile::decode(&text).map_err(|e| ConditionFileError::Parse {
        path: path.to_path_buf(),
        source: Box::new(e),
    })?;
    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(NamedCondition { name, file })
}

/// Whether `name` maps to a file directly inside the conditions directory
fn is_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

/// Write `file` as `<dir>/<name>.txt`, returning the path written
pub fn write_file(
    dir: &Path,
    name: &str,
    file: &ConditionFile,
) -> Result<PathBuf, ConditionFileError> {
    let io_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| ConditionFileError::Io { path, source }
    };

    if !is_file_name(name) {
        return Err(ConditionFileError::InvalidName(name.to_string()));
    }
    std::fs::create_dir_all(dir).map_err(io_error(dir))?;
    let path = dir.join(format!("{}.{}", name, CONDITION_EXTENSION));
    std::fs::write(&path, file.encode()).map_err(io_error(&path))?;
    Ok(path)
}

/// Read every condition file in `dir`, in natural order of file name.
///
/// Fails only when the directory itself cannot be read; each file carries
/// its own result.
pub fn read_dir(dir: &Path) -> Result<Vec<Result<NamedCondition, ConditionFileError>>, ConditionFileError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ConditionFileError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(CONDITION_EXTENSION))
        })
        .collect();
    paths.sort_by(|a, b| {
        natural_cmp(
            &a.file_name().unwrap_or_default().to_string_lossy(),
            &b.file_name().unwrap_or_default().to_string_lossy(),
        )
    });

    debug!(
        target: "conditions",
        "Found {} condition file(s) in {}",
        paths.len(),
        dir.display()
    );
    Ok(paths.iter().map(|path| read_file(path)).collect())
}

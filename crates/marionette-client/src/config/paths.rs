use std::path::PathBuf;

/// Platform-specific locations for marionette's files.
///
/// On macOS and Linux the XDG variables win over the platform defaults so
/// that both systems share one layout:
/// - Config: $XDG_CONFIG_HOME/{name} (default: ~/.config/{name})
/// - Data: $XDG_DATA_HOME/{name} (default: ~/.local/share/{name})
///
/// On Windows both live under %APPDATA%\{name}.
pub struct ProjectPaths {
    name: String,
    home: PathBuf,
}

impl ProjectPaths {
    /// `None` when no home directory can be determined
    pub fn new(name: &str) -> Option<Self> {
        let home = directories::BaseDirs::new()?.home_dir().to_path_buf();
        Some(ProjectPaths {
            name: name.to_string(),
            home,
        })
    }

    pub fn config_dir(&self) -> PathBuf {
        #[cfg(target_os = "windows")]
        {
            self.appdata()
        }

        #[cfg(not(target_os = "windows"))]
        {
            xdg_dir("XDG_CONFIG_HOME", || self.home.join(".config")).join(&self.name)
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        #[cfg(target_os = "windows")]
        {
            self.appdata()
        }

        #[cfg(not(target_os = "windows"))]
        {
            xdg_dir("XDG_DATA_HOME", || self.home.join(".local").join("share")).join(&self.name)
        }
    }

    /// Default directory holding one agent's condition files
    pub fn conditions_dir(&self, agent: &str) -> PathBuf {
        self.data_dir().join("conditions").join(agent)
    }

    #[cfg(target_os = "windows")]
    fn appdata(&self) -> PathBuf {
        directories::BaseDirs::new()
            .map(|b| b.config_dir().join(&self.name))
            .unwrap_or_else(|| self.home.join(format!(".{}", self.name)))
    }
}

#[cfg(not(target_os = "windows"))]
fn xdg_dir(var: &str, fallback: impl FnOnce() -> PathBuf) -> PathBuf {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(fallback)
}

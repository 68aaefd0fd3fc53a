//! Configuration model: global config, project configs, and structural diff.
//!
//! The global file is TOML with `[settings.*]` sections and `[files.NAME]`
//! blocks.  Project configs share the `[files.*]` shape but reject
//! `[settings]` outright — settings are daemon-global.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest;
use crate::paths::expand_path;

/// Filenames probed at each level of the project-config discovery walk,
/// used when `settings.project_config_names` is empty.
pub const DEFAULT_PROJECT_CONFIG_NAMES: &[&str] = &[
    ".slinky.toml",
    "slinky.toml",
    ".slinky/config.toml",
    "slinky/config.toml",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("project config {0:?}: [settings] is not allowed in project configs (daemon-global setting)")]
    SettingsInProject(PathBuf),
    #[error("file {name:?}: {reason}")]
    InvalidFile { name: String, reason: String },
    #[error("default_ttl must be positive")]
    NonPositiveTtl,
    #[error("hashing config: {0}")]
    Hash(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Auto,
    Fuse,
    Tmpfs,
    Fifo,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Fuse => "fuse",
            Self::Tmpfs => "tmpfs",
            Self::Fifo => "fifo",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "fuse" => Ok(Self::Fuse),
            "tmpfs" => Ok(Self::Tmpfs),
            "fifo" => Ok(Self::Fifo),
            other => Err(format!("unsupported mount backend: {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherKind {
    /// Fresh in-memory X25519 identity; the cache key dies with the process.
    Ephemeral,
}

impl std::fmt::Display for CipherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ephemeral => f.write_str("ephemeral"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictMode {
    /// Refuse to replace a non-managed entry at the symlink path.
    Error,
    /// Rename the existing entry with `backup_extension` appended.
    Backup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    Native,
    Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mount: MountSettings,
    pub cache: CacheSettings,
    pub symlink: SymlinkSettings,
    pub project_config_names: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mount: MountSettings::default(),
            cache: CacheSettings::default(),
            symlink: SymlinkSettings::default(),
            project_config_names: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountSettings {
    pub backend: BackendKind,
    pub mount_point: PathBuf,
}

impl Default for MountSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            mount_point: PathBuf::from("~/.secrets.d"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub cipher: CipherKind,
    #[serde(with = "duration_str")]
    pub default_ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cipher: CipherKind::Ephemeral,
            default_ttl: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymlinkSettings {
    pub conflict: ConflictMode,
    pub backup_extension: String,
}

impl Default for SymlinkSettings {
    fn default() -> Self {
        Self {
            conflict: ConflictMode::Error,
            backup_extension: ".bkp".to_string(),
        }
    }
}

/// One configured virtual file.  Immutable once loaded; replaced wholesale
/// on reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub render: RenderMode,
    /// Template source path.  Required in native mode; in command mode it is
    /// optional and participates only in fingerprinting.
    pub template: Option<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    /// POSIX file mode of the presented file.
    pub mode: u32,
    /// Per-file TTL override; `None` uses `settings.cache.default_ttl`.
    #[serde(with = "opt_duration_str")]
    pub ttl: Option<Duration>,
    /// Conventional path to symlink at the presented file (absolute,
    /// tilde/env-expandable).
    pub symlink: Option<String>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            render: RenderMode::Native,
            template: None,
            command: None,
            args: Vec::new(),
            mode: 0o600,
            ttl: None,
            symlink: None,
        }
    }
}

impl FileConfig {
    /// Effective TTL for this file.
    pub fn file_ttl(&self, default_ttl: Duration) -> Duration {
        self.ttl.unwrap_or(default_ttl)
    }

    /// Expanded template path, if a template is configured.
    pub fn template_path(&self) -> Option<PathBuf> {
        self.template.as_deref().map(expand_path)
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        match self.render {
            RenderMode::Native => {
                let Some(template) = self.template.as_deref() else {
                    return Err(ConfigError::InvalidFile {
                        name: name.to_string(),
                        reason: "native render mode requires 'template'".to_string(),
                    });
                };
                let path = expand_path(template);
                if let Err(e) = std::fs::metadata(&path) {
                    return Err(ConfigError::InvalidFile {
                        name: name.to_string(),
                        reason: format!("template {}: {e}", path.display()),
                    });
                }
            }
            RenderMode::Command => {
                if self.command.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::InvalidFile {
                        name: name.to_string(),
                        reason: "command render mode requires 'command'".to_string(),
                    });
                }
            }
        }
        if self.ttl == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidFile {
                name: name.to_string(),
                reason: "ttl must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub settings: Settings,
    pub files: HashMap<String, Arc<FileConfig>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            files: HashMap::new(),
        }
    }
}

impl Config {
    /// Read and validate the global config file.  The path is tilde/env
    /// expanded first.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let path = expand_path(&path.to_string_lossy());
        let data = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;

        let mut cfg: Config = toml::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;

        cfg.settings.mount.mount_point =
            expand_path(&cfg.settings.mount.mount_point.to_string_lossy());

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.settings.cache.default_ttl.is_zero() {
            return Err(ConfigError::NonPositiveTtl);
        }
        for (name, fc) in &self.files {
            fc.validate(name)?;
        }
        Ok(())
    }

    /// The project-config filename probe list, falling back to the defaults
    /// when the setting is empty.
    pub fn project_config_names(&self) -> Vec<String> {
        if !self.settings.project_config_names.is_empty() {
            return self.settings.project_config_names.clone();
        }
        DEFAULT_PROJECT_CONFIG_NAMES
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Hex-encoded SHA-256 of the config's JSON serialization.  Two configs
    /// with identical settings and files hash identically; used by external
    /// front-ends for staleness detection against the running daemon.
    pub fn hash(&self) -> Result<String, ConfigError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(digest::sha256_hex(&bytes))
    }
}

/// Process-wide handle to the current global config.
///
/// Readers (`resolver`, backend loops) clone the inner `Arc` and work on an
/// immutable snapshot; the reload prologue stores a replacement.  The lock
/// is held only for the pointer copy.
#[derive(Clone)]
pub struct CurrentConfig(std::sync::Arc<std::sync::RwLock<Arc<Config>>>);

impl CurrentConfig {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self(std::sync::Arc::new(std::sync::RwLock::new(cfg)))
    }

    pub fn load(&self) -> Arc<Config> {
        Arc::clone(
            &self
                .0
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    pub fn store(&self, cfg: Arc<Config>) {
        *self
            .0
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = cfg;
    }
}

/// Project root for a config file path.  For configs living in a one-level
/// subdirectory (e.g. `.slinky/config.toml`), the root is the grandparent;
/// otherwise the parent.
pub fn project_root(config_path: &Path, config_names: &[String]) -> PathBuf {
    let dir = config_path.parent().unwrap_or(Path::new("."));
    let base = dir.file_name().unwrap_or_default();
    for name in config_names {
        let name_path = Path::new(name);
        if let Some(subdir) = name_path.parent()
            && !subdir.as_os_str().is_empty()
            && subdir.as_os_str() == base
        {
            return dir.parent().unwrap_or(Path::new(".")).to_path_buf();
        }
    }
    dir.to_path_buf()
}

/// Resolve a config-relative path against the project root.  Absolute and
/// `~`-prefixed paths are returned as-is after expansion.
pub fn resolve_project_path(path: &str, root: &Path) -> String {
    let expanded = expand_path(path);
    if expanded.is_absolute() {
        return expanded.to_string_lossy().into_owned();
    }
    root.join(expanded).to_string_lossy().into_owned()
}

#[derive(Debug, Deserialize)]
struct ProjectConfig {
    #[serde(default)]
    files: HashMap<String, FileConfig>,
    // Present only so it can be detected and rejected.
    settings: Option<toml::Value>,
}

/// Read and parse a project-scoped config file.
pub fn load_project_config(
    path: &Path,
    config_names: &[String],
) -> Result<HashMap<String, Arc<FileConfig>>, ConfigError> {
    let data = std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_project_config(path, &data, config_names)
}

/// Parse a project config from already-read bytes.  Used when the file was
/// read once for trust verification, closing the TOCTOU window between the
/// trust check and the parse.
pub fn parse_project_config(
    path: &Path,
    data: &[u8],
    config_names: &[String],
) -> Result<HashMap<String, Arc<FileConfig>>, ConfigError> {
    let text = String::from_utf8_lossy(data);
    let pc: ProjectConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    if pc.settings.is_some() {
        return Err(ConfigError::SettingsInProject(path.to_path_buf()));
    }

    let root = project_root(path, config_names);

    let mut files = HashMap::with_capacity(pc.files.len());
    for (name, mut fc) in pc.files {
        if let Some(template) = fc.template.as_deref() {
            fc.template = Some(resolve_project_path(template, &root));
        }
        if let Some(symlink) = fc.symlink.as_deref() {
            fc.symlink = Some(resolve_project_path(symlink, &root));
        }
        files.insert(name, Arc::new(fc));
    }
    Ok(files)
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

/// Structural comparison of two configs, consumed by the reload dispatcher.
#[derive(Debug, Clone)]
pub struct DiffResult {
    pub old_settings: Settings,
    pub new_settings: Settings,
    pub old_files: HashMap<String, Arc<FileConfig>>,
    pub new_files: HashMap<String, Arc<FileConfig>>,
}

impl DiffResult {
    pub fn settings_changed(&self) -> bool {
        self.old_settings != self.new_settings
    }

    pub fn files_changed(&self) -> bool {
        self.old_files != self.new_files
    }

    pub fn has_changes(&self) -> bool {
        self.settings_changed() || self.files_changed()
    }

    pub fn files_added(&self) -> Vec<String> {
        self.new_files
            .keys()
            .filter(|name| !self.old_files.contains_key(*name))
            .cloned()
            .collect()
    }

    pub fn files_removed(&self) -> Vec<String> {
        self.old_files
            .keys()
            .filter(|name| !self.new_files.contains_key(*name))
            .cloned()
            .collect()
    }

    pub fn files_modified(&self) -> Vec<String> {
        self.old_files
            .iter()
            .filter_map(|(name, old_fc)| match self.new_files.get(name) {
                Some(new_fc) if new_fc != old_fc => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}

pub fn diff(old: &Config, new: &Config) -> DiffResult {
    DiffResult {
        old_settings: old.settings.clone(),
        new_settings: new.settings.clone(),
        old_files: old.files.clone(),
        new_files: new.files.clone(),
    }
}

// ---------------------------------------------------------------------------
// Duration (de)serialization — humantime strings ("5m", "90s", "1h30m")
// ---------------------------------------------------------------------------

pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

pub mod opt_duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.collect_str(&humantime::format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let text: Option<String> = Option::deserialize(d)?;
        match text {
            None => Ok(None),
            Some(text) => humantime::parse_duration(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

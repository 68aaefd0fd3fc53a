//! Template rendering: native (expression language) and command mode.
//!
//! Both modes sit behind [`TemplateRenderer`].  Rendering is synchronous and
//! may block (file reads, subprocess execution up to the 10 s timeout); the
//! resolver confines it to blocking tasks.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;
use tracing::debug;

use crate::config::{FileConfig, RenderMode};
use crate::paths::expand_path;

pub mod template;
pub mod watcher;

use template::{Builtins, TemplateError};

/// Hard ceiling on `exec` builtin and command-mode subprocesses.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variables always forwarded to command-mode renders.  Command
/// output cannot be statically inspected, so only this basic set of an
/// activation's captured env crosses the boundary.
const COMMAND_ENV_ALLOWLIST: &[&str] =
    &["HOME", "USER", "LOGNAME", "PATH", "SHELL", "TERM", "LANG"];

/// Resolves environment variables during rendering.  Built from an
/// activation's captured env, falling back to the process environment.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// An [`EnvLookup`] over the process environment only.
pub fn process_env_lookup() -> EnvLookup {
    Arc::new(|key| std::env::var(key).ok())
}

/// An [`EnvLookup`] that consults `env` first, then the process environment.
pub fn layered_env_lookup(env: Option<HashMap<String, String>>) -> EnvLookup {
    match env {
        None => process_env_lookup(),
        Some(env) => Arc::new(move |key| env.get(key).cloned().or_else(|| std::env::var(key).ok())),
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("native render mode requires a template")]
    MissingTemplate,
    #[error("command render mode requires a command")]
    MissingCommand,
    #[error("reading template {path:?}: {source}")]
    ReadTemplate {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing template {path:?}: {source}")]
    ParseTemplate {
        path: PathBuf,
        source: TemplateError,
    },
    #[error("executing template {path:?}: {source}")]
    ExecuteTemplate {
        path: PathBuf,
        source: TemplateError,
    },
    #[error("command {command:?}: {message}")]
    Command { command: String, message: String },
}

pub trait TemplateRenderer: Send + Sync {
    fn render(
        &self,
        name: &str,
        fc: &FileConfig,
        env_lookup: &EnvLookup,
        env_overrides: Option<&HashMap<String, String>>,
    ) -> Result<Vec<u8>, RenderError>;
}

static NATIVE: LazyLock<NativeRenderer> = LazyLock::new(NativeRenderer::new);
static COMMAND: CommandRenderer = CommandRenderer;

/// The renderer for a file's configured mode.  The native renderer is
/// shared so its template-text cache spans all files.
pub fn renderer_for(fc: &FileConfig) -> &'static dyn TemplateRenderer {
    match fc.render {
        RenderMode::Native => &*NATIVE,
        RenderMode::Command => &COMMAND,
    }
}

// ---------------------------------------------------------------------------
// Native renderer
// ---------------------------------------------------------------------------

struct CachedTemplate {
    text: String,
    mtime: SystemTime,
}

/// Renders through the expression engine with the four domain builtins.
///
/// Template *text* is cached keyed by absolute path and invalidated on
/// mtime change.  Parsing happens on every render: the same text may bind
/// differently per call (env lookup chain, overrides).
pub struct NativeRenderer {
    cache: RwLock<HashMap<PathBuf, CachedTemplate>>,
}

impl NativeRenderer {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn load_template(&self, path: &Path) -> Result<String, RenderError> {
        let meta = std::fs::metadata(path).map_err(|source| RenderError::ReadTemplate {
            path: path.to_path_buf(),
            source,
        })?;
        let mtime = meta.modified().map_err(|source| RenderError::ReadTemplate {
            path: path.to_path_buf(),
            source,
        })?;

        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(cached) = cache.get(path)
                && cached.mtime == mtime
            {
                return Ok(cached.text.clone());
            }
        }

        let text =
            std::fs::read_to_string(path).map_err(|source| RenderError::ReadTemplate {
                path: path.to_path_buf(),
                source,
            })?;

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.insert(
            path.to_path_buf(),
            CachedTemplate {
                text: text.clone(),
                mtime,
            },
        );
        Ok(text)
    }
}

impl Default for NativeRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer for NativeRenderer {
    fn render(
        &self,
        _name: &str,
        fc: &FileConfig,
        env_lookup: &EnvLookup,
        env_overrides: Option<&HashMap<String, String>>,
    ) -> Result<Vec<u8>, RenderError> {
        let template = fc.template.as_deref().ok_or(RenderError::MissingTemplate)?;
        let path = expand_path(template);
        let text = self.load_template(&path)?;

        let parsed = template::parse(&text).map_err(|source| RenderError::ParseTemplate {
            path: path.clone(),
            source,
        })?;

        let builtins = DomainBuiltins {
            env_lookup: Arc::clone(env_lookup),
            env_overrides: env_overrides.cloned(),
        };
        let rendered = parsed
            .render(&builtins)
            .map_err(|source| RenderError::ExecuteTemplate { path, source })?;

        Ok(rendered.into_bytes())
    }
}

/// The contract builtins bound to one render call.
struct DomainBuiltins {
    env_lookup: EnvLookup,
    env_overrides: Option<HashMap<String, String>>,
}

impl Builtins for DomainBuiltins {
    fn env(&self, key: &str) -> Result<String, String> {
        (self.env_lookup)(key)
            .ok_or_else(|| format!("required environment variable {key:?} is not set"))
    }

    fn env_default(&self, key: &str, fallback: &str) -> String {
        match (self.env_lookup)(key) {
            Some(v) if !v.is_empty() => v,
            _ => fallback.to_string(),
        }
    }

    fn file(&self, path: &str) -> Result<String, String> {
        debug!(path, "template function: file");
        let expanded = expand_path(path);
        std::fs::read_to_string(&expanded)
            .map_err(|e| format!("reading file {:?}: {e}", expanded.display()))
    }

    fn exec(&self, cmd: &str, args: &[String]) -> Result<String, String> {
        debug!(command = cmd, ?args, "template function: exec");
        let output = run_with_timeout(cmd, args, self.env_overrides.as_ref())
            .map_err(|e| format!("exec {cmd:?}: {e}"))?;
        Ok(output.trim_end_matches('\n').to_string())
    }
}

// ---------------------------------------------------------------------------
// Command renderer
// ---------------------------------------------------------------------------

/// Runs the configured command and presents its stdout as the file bytes.
pub struct CommandRenderer;

impl TemplateRenderer for CommandRenderer {
    fn render(
        &self,
        _name: &str,
        fc: &FileConfig,
        _env_lookup: &EnvLookup,
        env_overrides: Option<&HashMap<String, String>>,
    ) -> Result<Vec<u8>, RenderError> {
        let command = fc
            .command
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or(RenderError::MissingCommand)?;

        let args: Vec<String> = fc
            .args
            .iter()
            .map(|a| expand_path(a).to_string_lossy().into_owned())
            .collect();

        run_with_timeout(command, &args, env_overrides)
            .map(String::into_bytes)
            .map_err(|message| RenderError::Command {
                command: command.to_string(),
                message,
            })
    }
}

// ---------------------------------------------------------------------------
// Subprocess plumbing
// ---------------------------------------------------------------------------

/// Run `cmd args...` with `env_overrides` merged over the process env
/// (overrides replace, not duplicate).  Fails after [`TIMEOUT`]; failures
/// include trimmed stderr.
fn run_with_timeout(
    cmd: &str,
    args: &[String],
    env_overrides: Option<&HashMap<String, String>>,
) -> Result<String, String> {
    let cmd_path = resolve_command(cmd, env_overrides)?;

    let mut command = Command::new(&cmd_path);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(overrides) = env_overrides {
        // Command inherits the process env; envs() layers the overrides on
        // top, replacing any existing keys.
        command.envs(overrides);
    }

    let mut child = command.spawn().map_err(|e| format!("spawning: {e}"))?;

    // Drain stdout/stderr on threads so a chatty child cannot deadlock on a
    // full pipe while we poll for exit.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_reader = std::thread::spawn(move || read_all(stdout));
    let stderr_reader = std::thread::spawn(move || read_all(stderr));

    let deadline = Instant::now() + TIMEOUT;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    let stderr = stderr_reader.join().unwrap_or_default();
                    return Err(format!(
                        "timed out after {}s (stderr: {})",
                        TIMEOUT.as_secs(),
                        stderr.trim()
                    ));
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(e) => return Err(format!("waiting: {e}")),
        }
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    if !status.success() {
        return Err(format!("{status} (stderr: {})", stderr.trim()));
    }
    Ok(stdout)
}

fn read_all(pipe: Option<impl Read>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buf);
    }
    buf
}

/// Resolve a command name against the PATH visible to the render: the
/// overrides' PATH when present, the process PATH otherwise.  Names
/// containing a separator are expanded and used as-is.
fn resolve_command(
    cmd: &str,
    env_overrides: Option<&HashMap<String, String>>,
) -> Result<String, String> {
    if cmd.contains('/') {
        return Ok(expand_path(cmd).to_string_lossy().into_owned());
    }

    let path_var = env_overrides
        .and_then(|env| env.get("PATH").cloned())
        .or_else(|| std::env::var("PATH").ok())
        .unwrap_or_default();

    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(cmd);
        if is_executable(&candidate) {
            return Ok(candidate.to_string_lossy().into_owned());
        }
    }
    Err(format!("{cmd:?} not found in PATH"))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Static env narrowing
// ---------------------------------------------------------------------------

/// The env var names a native template statically references, or `None` on
/// any error (missing/unparseable template, command mode).  Callers treat
/// `None` as "keep all env".
pub fn extract_env_vars(fc: &FileConfig) -> Option<std::collections::HashSet<String>> {
    if fc.render == RenderMode::Command {
        return None;
    }
    let path = fc.template_path()?;
    let text = std::fs::read_to_string(&path).ok()?;
    let parsed = template::parse(&text).ok()?;
    Some(parsed.referenced_env_vars())
}

/// Narrow an activation's captured env to what the file's render will
/// consume: the statically-referenced set for native templates (the full
/// env when extraction fails), the fixed allowlist for command mode.
/// `None` env (global layer without activations) stays `None`.
pub fn filter_env(
    fc: &FileConfig,
    env: Option<&HashMap<String, String>>,
) -> Option<HashMap<String, String>> {
    let env = env?;

    if fc.render == RenderMode::Command {
        let filtered = COMMAND_ENV_ALLOWLIST
            .iter()
            .filter_map(|key| env.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect();
        return Some(filtered);
    }

    match extract_env_vars(fc) {
        None => Some(env.clone()),
        Some(vars) => Some(
            env.iter()
                .filter(|(k, _)| vars.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
    }
}

//! Directory-scoped secret contexts.
//!
//! The manager discovers project configs by walking up from a target
//! directory, merges them with the global config (deepest directory wins per
//! file name), and tracks per-layer environment variables captured at
//! activation time.
//!
//! Multiple directories can be active simultaneously (additive activation).
//! Each activation is keyed by canonical directory path; re-activating the
//! same directory updates it in place.  If two different activations define
//! the same file name, activation fails with a conflict and state is rolled
//! back to exactly what it was.
//!
//! Lock ordering: the activation mutex is acquired before the state
//! RwLock, never the other way around.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use thiserror::Error;
use tracing::warn;

use crate::config::{Config, FileConfig, load_project_config, parse_project_config};
use crate::paths::home_dir;
use crate::render::{EnvLookup, filter_env, layered_env_lookup};
use crate::trust::{TrustError, TrustStore};

pub mod reaper;

pub use reaper::SessionReaper;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("conflict: file {name:?} is defined by both {first:?} and {second:?}")]
    Conflict {
        name: String,
        first: String,
        second: String,
    },
    #[error(transparent)]
    Trust(#[from] TrustError),
}

/// One discovered project-config file's contribution to an activation.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Directory containing the config file.
    pub dir: PathBuf,
    pub files: HashMap<String, Arc<FileConfig>>,
    /// Env vars captured at activation time.
    pub env: HashMap<String, String>,
}

/// The merged per-name view consumed by backends and the resolver: the
/// winning file config plus the env subset its render will see.
#[derive(Debug, Clone)]
pub struct EffectiveFile {
    pub file: Arc<FileConfig>,
    /// `None` for global files with no active activations (renders see the
    /// process environment only).
    pub env: Option<HashMap<String, String>>,
}

impl EffectiveFile {
    /// Lookup chain for rendering: captured env first, process env second.
    pub fn env_lookup(&self) -> EnvLookup {
        layered_env_lookup(self.env.clone())
    }
}

impl PartialEq for EffectiveFile {
    fn eq(&self, other: &Self) -> bool {
        (Arc::ptr_eq(&self.file, &other.file) || *self.file == *other.file)
            && self.env == other.env
    }
}

#[derive(Debug, Clone)]
pub struct Activation {
    pub dir: String,
    pub layers: Vec<Layer>,
    /// Env captured at activation time (present even with no layers).
    pub env: HashMap<String, String>,
    /// Files contributed by project layers only (not global).
    overrides: HashMap<String, EffectiveFile>,
    /// PIDs referencing this activation (empty = no tracking).
    sessions: HashSet<i32>,
}

impl Activation {
    pub fn session_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.sessions.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn layer_dirs(&self) -> Vec<String> {
        self.layers
            .iter()
            .map(|l| l.dir.to_string_lossy().into_owned())
            .collect()
    }
}

pub type OnChange = Box<dyn Fn(HashMap<String, EffectiveFile>) + Send + Sync>;

struct State {
    global_files: HashMap<String, Arc<FileConfig>>,
    config_names: Vec<String>,
    /// Canonical dir → activation.  BTreeMap so iteration is the
    /// alphabetical dir order the merge rules require.
    activations: BTreeMap<String, Activation>,
    effective: HashMap<String, EffectiveFile>,
    pid_to_dirs: HashMap<i32, HashSet<String>>,
}

/// Tracks directory-scoped activations and computes the merged effective
/// file set.
pub struct ContextManager {
    /// Serializes activate/deactivate/remove_session/update_global.
    activate_mu: Mutex<()>,
    /// Guards the maps for concurrent readers (backends, control handlers).
    state: RwLock<State>,
    on_change: Option<OnChange>,
    trust: Mutex<Option<Arc<TrustStore>>>,
}

impl ContextManager {
    pub fn new(global: &Config, config_names: Vec<String>, on_change: Option<OnChange>) -> Self {
        let mut state = State {
            global_files: global.files.clone(),
            config_names,
            activations: BTreeMap::new(),
            effective: HashMap::new(),
            pid_to_dirs: HashMap::new(),
        };
        state.effective = recompute(&state).unwrap_or_default();

        Self {
            activate_mu: Mutex::new(()),
            state: RwLock::new(state),
            on_change,
            trust: Mutex::new(None),
        }
    }

    /// Attach the trust predicate.  Without one, every project config is
    /// treated as approved (tests, trust managed externally).
    pub fn set_trust_store(&self, trust: Arc<TrustStore>) {
        *self
            .trust
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(trust);
    }

    /// A copy of the current merged file set.
    pub fn effective(&self) -> HashMap<String, EffectiveFile> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.effective.clone()
    }

    /// Just the file config for each effective file.
    pub fn effective_file_configs(&self) -> HashMap<String, Arc<FileConfig>> {
        self.effective()
            .into_iter()
            .map(|(name, ef)| (name, ef.file))
            .collect()
    }

    pub fn activations(&self) -> BTreeMap<String, Activation> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.activations.clone()
    }

    /// Session PIDs per activated dir (dirs with no sessions omitted).
    pub fn sessions(&self) -> HashMap<String, Vec<i32>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .activations
            .iter()
            .filter(|(_, act)| !act.sessions.is_empty())
            .map(|(dir, act)| (dir.clone(), act.session_ids()))
            .collect()
    }

    pub fn tracked_pids(&self) -> Vec<i32> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.pid_to_dirs.keys().copied().collect()
    }

    /// Discover project configs walking up from `dir`, merge with global,
    /// and install the activation.  With `pid > 0` the PID is recorded as a
    /// reference holder and removed from every other activation it held
    /// (auto-deactivation) — atomically: a conflict rolls the whole call
    /// back.  Returns the effective file names.
    pub fn activate(
        &self,
        dir: &Path,
        env: HashMap<String, String>,
        pid: i32,
    ) -> Result<Vec<String>, ContextError> {
        let _guard = self
            .activate_mu
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let dir_key = canonical_dir(dir);
        let config_names = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            state.config_names.clone()
        };

        let paths = discover_layers(Path::new(&dir_key), &config_names);
        let layers = self.load_layers(&paths, &env, &config_names)?;

        let mut overrides = HashMap::new();
        for layer in &layers {
            for (name, fc) in &layer.files {
                overrides.insert(
                    name.clone(),
                    EffectiveFile {
                        file: Arc::clone(fc),
                        env: Some(layer.env.clone()),
                    },
                );
            }
        }
        let mut activation = Activation {
            dir: dir_key.clone(),
            layers,
            env,
            overrides,
            sessions: HashSet::new(),
        };

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let old = state.activations.get(&dir_key).cloned();

        if let Some(old) = &old {
            activation.sessions = old.sessions.clone();
        }
        let pid_already_held = old
            .as_ref()
            .is_some_and(|old| old.sessions.contains(&pid));

        if pid > 0 {
            activation.sessions.insert(pid);
            state
                .pid_to_dirs
                .entry(pid)
                .or_default()
                .insert(dir_key.clone());
        }

        state.activations.insert(dir_key.clone(), activation);

        // Auto-deactivate: this session leaves every other directory.
        let mut removed: HashMap<String, Activation> = HashMap::new();
        if pid > 0 {
            let other_dirs: Vec<String> = state
                .pid_to_dirs
                .get(&pid)
                .map(|dirs| dirs.iter().filter(|d| **d != dir_key).cloned().collect())
                .unwrap_or_default();

            for d in other_dirs {
                if let Some(dirs) = state.pid_to_dirs.get_mut(&pid) {
                    dirs.remove(&d);
                }
                let emptied = match state.activations.get_mut(&d) {
                    Some(act) => {
                        act.sessions.remove(&pid);
                        act.sessions.is_empty()
                    }
                    None => continue,
                };
                if emptied && let Some(act) = state.activations.remove(&d) {
                    removed.insert(d, act);
                }
            }
        }

        match recompute(&state) {
            Ok(effective) => {
                state.effective = effective.clone();
                drop(state);
                self.fire_on_change(effective.clone());
                Ok(effective.into_keys().collect())
            }
            Err(e) => {
                // Roll back every mutation performed in this call.
                match old {
                    Some(old) => {
                        state.activations.insert(dir_key.clone(), old);
                    }
                    None => {
                        state.activations.remove(&dir_key);
                    }
                }
                for (d, mut act) in removed {
                    act.sessions.insert(pid);
                    state
                        .pid_to_dirs
                        .entry(pid)
                        .or_default()
                        .insert(d.clone());
                    state.activations.insert(d, act);
                }
                if pid > 0 && !pid_already_held {
                    if let Some(dirs) = state.pid_to_dirs.get_mut(&pid) {
                        dirs.remove(&dir_key);
                        if dirs.is_empty() {
                            state.pid_to_dirs.remove(&pid);
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Remove an activation.  With `pid > 0` only that session reference is
    /// removed and the activation survives while other sessions remain;
    /// `pid == 0` force-removes.  Unknown dirs are a no-op.  Returns the
    /// remaining effective file names.
    pub fn deactivate(&self, dir: &Path, pid: i32) -> Vec<String> {
        let _guard = self
            .activate_mu
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let dir_key = canonical_dir(dir);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if !state.activations.contains_key(&dir_key) {
            return state.effective.keys().cloned().collect();
        }

        if pid > 0 {
            if let Some(act) = state.activations.get_mut(&dir_key) {
                act.sessions.remove(&pid);
            }
            if let Some(dirs) = state.pid_to_dirs.get_mut(&pid) {
                dirs.remove(&dir_key);
                if dirs.is_empty() {
                    state.pid_to_dirs.remove(&pid);
                }
            }
            let remaining = state
                .activations
                .get(&dir_key)
                .map(|act| act.sessions.len())
                .unwrap_or(0);
            if remaining > 0 {
                return state.effective.keys().cloned().collect();
            }
        }

        if let Some(act) = state.activations.remove(&dir_key) {
            for s in &act.sessions {
                if let Some(dirs) = state.pid_to_dirs.get_mut(s) {
                    dirs.remove(&dir_key);
                    if dirs.is_empty() {
                        state.pid_to_dirs.remove(s);
                    }
                }
            }
        }

        let effective = match recompute(&state) {
            Ok(effective) => effective,
            Err(e) => {
                // Removal cannot introduce new conflicts; keep serving the
                // previous set if it somehow does.
                warn!(error = %e, "recompute after deactivate failed");
                return state.effective.keys().cloned().collect();
            }
        };
        state.effective = effective.clone();
        drop(state);
        self.fire_on_change(effective.clone());
        effective.into_keys().collect()
    }

    /// Remove a PID from every activation it references (reaper path).
    /// Returns the directories that were fully deactivated, sorted.
    pub fn remove_session(&self, pid: i32) -> Vec<String> {
        let _guard = self
            .activate_mu
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let Some(dirs) = state.pid_to_dirs.remove(&pid) else {
            return Vec::new();
        };

        let mut deactivated = Vec::new();
        for dir in dirs {
            let Some(act) = state.activations.get_mut(&dir) else {
                continue;
            };
            act.sessions.remove(&pid);
            if act.sessions.is_empty() {
                state.activations.remove(&dir);
                deactivated.push(dir);
            }
        }

        if deactivated.is_empty() {
            return deactivated;
        }

        if let Ok(effective) = recompute(&state) {
            state.effective = effective.clone();
            drop(state);
            self.fire_on_change(effective);
        }
        deactivated.sort_unstable();
        deactivated
    }

    /// Swap the global layer after a config reload.  The on-change callback
    /// fires only when the effective set actually changed.
    pub fn update_global(&self, new_config: &Config, config_names: Vec<String>) {
        let _guard = self
            .activate_mu
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.global_files = new_config.files.clone();
        state.config_names = config_names;

        let Ok(effective) = recompute(&state) else {
            warn!("recompute after global config update failed, keeping current set");
            return;
        };

        if effective == state.effective {
            return;
        }
        state.effective = effective.clone();
        drop(state);
        self.fire_on_change(effective);
    }

    /// Re-discover and rebuild one activation in place (its config files may
    /// have changed on disk).  Unknown dirs are a no-op.
    pub fn refresh_activation(&self, dir: &Path) -> Result<(), ContextError> {
        let _guard = self
            .activate_mu
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let dir_key = canonical_dir(dir);
        let (env, config_names) = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            match state.activations.get(&dir_key) {
                Some(act) => (act.env.clone(), state.config_names.clone()),
                None => return Ok(()),
            }
        };

        let paths = discover_layers(Path::new(&dir_key), &config_names);
        let layers = self.load_layers(&paths, &env, &config_names)?;

        let mut overrides = HashMap::new();
        for layer in &layers {
            for (name, fc) in &layer.files {
                overrides.insert(
                    name.clone(),
                    EffectiveFile {
                        file: Arc::clone(fc),
                        env: Some(layer.env.clone()),
                    },
                );
            }
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let Some(old) = state.activations.get(&dir_key).cloned() else {
            return Ok(());
        };
        let mut activation = old.clone();
        activation.layers = layers;
        activation.overrides = overrides;
        state.activations.insert(dir_key.clone(), activation);

        match recompute(&state) {
            Ok(effective) => {
                state.effective = effective.clone();
                drop(state);
                self.fire_on_change(effective);
                Ok(())
            }
            Err(e) => {
                state.activations.insert(dir_key, old);
                Err(e)
            }
        }
    }

    fn load_layers(
        &self,
        paths: &[PathBuf],
        env: &HashMap<String, String>,
        config_names: &[String],
    ) -> Result<Vec<Layer>, ContextError> {
        let trust = self
            .trust
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut layers = Vec::with_capacity(paths.len());

        if let Some(trust) = trust {
            // Read once, verify hash, parse the verified bytes: no window
            // between the trust check and the parse.
            let verified = trust.read_and_verify_paths(paths)?;
            for file in verified {
                match parse_project_config(&file.path, &file.data, config_names) {
                    Ok(files) => layers.push(Layer {
                        dir: file.path.parent().unwrap_or(Path::new("/")).to_path_buf(),
                        files,
                        env: env.clone(),
                    }),
                    Err(e) => {
                        warn!(path = %file.path.display(), error = %e, "skipping invalid project config");
                    }
                }
            }
        } else {
            for path in paths {
                match load_project_config(path, config_names) {
                    Ok(files) => layers.push(Layer {
                        dir: path.parent().unwrap_or(Path::new("/")).to_path_buf(),
                        files,
                        env: env.clone(),
                    }),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping invalid project config");
                    }
                }
            }
        }

        Ok(layers)
    }

    /// Callbacks run outside the locks; the map they observe is already the
    /// committed one.
    fn fire_on_change(&self, effective: HashMap<String, EffectiveFile>) {
        if let Some(on_change) = &self.on_change {
            on_change(effective);
        }
    }
}

/// Requires the state lock to be held by the caller.
fn recompute(state: &State) -> Result<HashMap<String, EffectiveFile>, ContextError> {
    // Merged env for global files: key-wise union over activations in
    // alphabetical dir order, last wins.
    let merged_env = if state.activations.is_empty() {
        None
    } else {
        let mut merged = HashMap::new();
        for act in state.activations.values() {
            for (k, v) in &act.env {
                merged.insert(k.clone(), v.clone());
            }
        }
        Some(merged)
    };

    let mut effective: HashMap<String, EffectiveFile> = state
        .global_files
        .iter()
        .map(|(name, fc)| {
            (
                name.clone(),
                EffectiveFile {
                    file: Arc::clone(fc),
                    env: merged_env.clone(),
                },
            )
        })
        .collect();

    let mut owners: HashMap<&str, &str> = HashMap::new();
    for (dir, act) in &state.activations {
        for (name, ef) in &act.overrides {
            if let Some(owner) = owners.get(name.as_str())
                && *owner != dir.as_str()
            {
                return Err(ContextError::Conflict {
                    name: name.clone(),
                    first: owner.to_string(),
                    second: dir.clone(),
                });
            }
            owners.insert(name, dir);
            effective.insert(name.clone(), ef.clone());
        }
    }

    // Narrow each file's env to what its render will consume.
    for ef in effective.values_mut() {
        ef.env = filter_env(&ef.file, ef.env.as_ref());
    }

    Ok(effective)
}

fn canonical_dir(dir: &Path) -> String {
    std::fs::canonicalize(dir)
        .or_else(|_| std::path::absolute(dir))
        .unwrap_or_else(|_| dir.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

/// Walk from `dir` up to `$HOME` (or `/`), probing the configured filename
/// list at each level and taking the first hit per level.  Returns
/// shallowest-first order.
pub fn discover_layers(dir: &Path, config_names: &[String]) -> Vec<PathBuf> {
    let home = home_dir();
    let mut paths = Vec::new();
    let mut current = dir.to_path_buf();

    loop {
        for name in config_names {
            let candidate = current.join(name);
            if candidate.exists() {
                paths.push(candidate);
                break;
            }
        }

        if current == home || current == Path::new("/") {
            break;
        }
        match current.parent() {
            Some(parent) if parent != current => current = parent.to_path_buf(),
            _ => break,
        }
    }

    paths.reverse();
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn global_with(files: &[(&str, &str)]) -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        for (name, template_body) in files {
            let tpl = dir.path().join(format!("{}.tpl", name.replace('/', "_")));
            std::fs::write(&tpl, template_body).unwrap();
            cfg.files.insert(
                name.to_string(),
                Arc::new(FileConfig {
                    template: Some(tpl.to_string_lossy().into_owned()),
                    ..FileConfig::default()
                }),
            );
        }
        (dir, cfg)
    }

    /// A project dir whose `.slinky.toml` defines `name` with a template
    /// referencing `env_keys`.
    fn project_dir(parent: &Path, dir_name: &str, file_names: &[(&str, &[&str])]) -> PathBuf {
        let proj = parent.join(dir_name);
        std::fs::create_dir_all(&proj).unwrap();

        let mut toml = String::new();
        for (name, env_keys) in file_names {
            let body: String = env_keys
                .iter()
                .map(|k| format!("{{{{ env \"{k}\" }}}}\n"))
                .collect();
            let tpl_name = format!("{}.tpl", name.replace('/', "_"));
            std::fs::write(proj.join(&tpl_name), body).unwrap();
            toml.push_str(&format!("[files.\"{name}\"]\ntemplate = \"{tpl_name}\"\n\n"));
        }
        std::fs::write(proj.join(".slinky.toml"), toml).unwrap();
        proj
    }

    fn manager(cfg: &Config) -> ContextManager {
        ContextManager::new(cfg, cfg.project_config_names(), None)
    }

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn global_files_effective_without_activations() {
        let (_tmp, cfg) = global_with(&[("netrc", "x")]);
        let m = manager(&cfg);
        let eff = m.effective();
        assert_eq!(eff.len(), 1);
        assert!(eff["netrc"].env.is_none());
    }

    #[test]
    fn project_override_wins_and_carries_env() {
        // S2: global netrc, project overrides it; the project template
        // references ORG_TOKEN so narrowing keeps it.
        let (_tmp, cfg) = global_with(&[("netrc", "global")]);
        let work = tempfile::tempdir().unwrap();
        let proj = project_dir(work.path(), "org-a", &[("netrc", &["ORG_TOKEN"])]);

        let m = manager(&cfg);
        let names = m
            .activate(&proj, env(&[("ORG_TOKEN", "abc")]), 0)
            .unwrap();
        assert_eq!(names, vec!["netrc".to_string()]);

        let eff = m.effective();
        let netrc = &eff["netrc"];
        assert!(
            netrc
                .file
                .template
                .as_deref()
                .unwrap()
                .ends_with("netrc.tpl")
        );
        assert!(netrc.file.template.as_deref().unwrap().contains("org-a"));
        assert_eq!(
            netrc.env.as_ref().unwrap().get("ORG_TOKEN").map(String::as_str),
            Some("abc")
        );
    }

    #[test]
    fn conflicting_activations_fail_atomically() {
        // S3 + property 2: second activation conflicts; state is untouched.
        let (_tmp, cfg) = global_with(&[]);
        let work = tempfile::tempdir().unwrap();
        let a = project_dir(work.path(), "proj-a", &[("netrc", &["A"])]);
        let b = project_dir(work.path(), "proj-b", &[("netrc", &["B"])]);

        let m = manager(&cfg);
        let names = m.activate(&a, env(&[("A", "1")]), 100).unwrap();
        assert_eq!(names, vec!["netrc".to_string()]);

        let acts_before = m.activations();
        let eff_before = m.effective();
        let pids_before = m.tracked_pids();

        let err = m.activate(&b, env(&[("B", "2")]), 200).unwrap_err();
        assert!(err.to_string().contains("conflict"));

        // Bit-identical state after the failed call.
        let acts_after = m.activations();
        assert_eq!(
            acts_before.keys().collect::<Vec<_>>(),
            acts_after.keys().collect::<Vec<_>>()
        );
        assert_eq!(eff_before["netrc"], m.effective()["netrc"]);
        assert_eq!(pids_before, m.tracked_pids());
        assert!(m.effective()["netrc"]
            .file
            .template
            .as_deref()
            .unwrap()
            .contains("proj-a"));
    }

    #[test]
    fn auto_deactivation_moves_session_between_dirs() {
        // S4 + property 3.
        let (_tmp, cfg) = global_with(&[]);
        let work = tempfile::tempdir().unwrap();
        let a = project_dir(work.path(), "proj-a", &[("netrc", &[])]);
        let b = project_dir(work.path(), "proj-b", &[("npmrc", &[])]);

        let m = manager(&cfg);
        m.activate(&a, env(&[]), 1000).unwrap();
        m.activate(&b, env(&[]), 1000).unwrap();

        let acts = m.activations();
        assert_eq!(acts.len(), 1);
        assert!(acts.keys().next().unwrap().contains("proj-b"));

        let eff = m.effective();
        assert_eq!(eff.len(), 1);
        assert!(eff.contains_key("npmrc"));

        assert!(m.sessions().values().all(|pids| pids == &vec![1000]));
    }

    #[test]
    fn session_refcount_keeps_activation_alive() {
        // Property 4.
        let (_tmp, cfg) = global_with(&[]);
        let work = tempfile::tempdir().unwrap();
        let proj = project_dir(work.path(), "proj", &[("netrc", &[])]);

        let m = manager(&cfg);
        for pid in [11, 22, 33] {
            m.activate(&proj, env(&[]), pid).unwrap();
        }

        m.deactivate(&proj, 11);
        assert_eq!(m.activations().len(), 1);
        m.deactivate(&proj, 22);
        assert_eq!(m.activations().len(), 1);
        m.deactivate(&proj, 33);
        assert!(m.activations().is_empty());
        assert!(m.tracked_pids().is_empty());
    }

    #[test]
    fn force_deactivate_removes_despite_sessions() {
        let (_tmp, cfg) = global_with(&[]);
        let work = tempfile::tempdir().unwrap();
        let proj = project_dir(work.path(), "proj", &[("netrc", &[])]);

        let m = manager(&cfg);
        m.activate(&proj, env(&[]), 42).unwrap();
        m.deactivate(&proj, 0);
        assert!(m.activations().is_empty());
        assert!(m.tracked_pids().is_empty());
    }

    #[test]
    fn deactivate_unknown_dir_is_noop() {
        let (_tmp, cfg) = global_with(&[("netrc", "x")]);
        let m = manager(&cfg);
        let names = m.deactivate(Path::new("/definitely/not/active"), 0);
        assert_eq!(names, vec!["netrc".to_string()]);
    }

    #[test]
    fn remove_session_drops_emptied_activations() {
        // Property 5 groundwork (reaper calls remove_session).
        let (_tmp, cfg) = global_with(&[]);
        let work = tempfile::tempdir().unwrap();
        let a = project_dir(work.path(), "proj-a", &[("netrc", &[])]);
        let b = project_dir(work.path(), "proj-b", &[("npmrc", &[])]);

        let m = manager(&cfg);
        m.activate(&a, env(&[]), 77).unwrap();
        // Second holder for b keeps it alive.
        m.activate(&b, env(&[]), 88).unwrap();
        m.activate(&b, env(&[]), 99).unwrap();

        let dropped = m.remove_session(88);
        assert!(dropped.is_empty());
        assert_eq!(m.activations().len(), 2);

        let dropped = m.remove_session(77);
        assert_eq!(dropped.len(), 1);
        assert!(dropped[0].contains("proj-a"));
        assert_eq!(m.activations().len(), 1);
    }

    #[test]
    fn merge_is_order_independent_for_disjoint_names() {
        // Property 1.
        let (_tmp, cfg) = global_with(&[("global", "g")]);
        let work = tempfile::tempdir().unwrap();
        let a = project_dir(work.path(), "proj-a", &[("netrc", &[])]);
        let b = project_dir(work.path(), "proj-b", &[("npmrc", &[])]);

        let m1 = manager(&cfg);
        m1.activate(&a, env(&[]), 0).unwrap();
        m1.activate(&b, env(&[]), 0).unwrap();

        let m2 = manager(&cfg);
        m2.activate(&b, env(&[]), 0).unwrap();
        m2.activate(&a, env(&[]), 0).unwrap();

        let names1: Vec<_> = {
            let mut v: Vec<_> = m1.effective().into_keys().collect();
            v.sort();
            v
        };
        let names2: Vec<_> = {
            let mut v: Vec<_> = m2.effective().into_keys().collect();
            v.sort();
            v
        };
        assert_eq!(names1, names2);
        assert_eq!(names1, vec!["global", "netrc", "npmrc"]);
    }

    #[test]
    fn merged_env_last_dir_wins_for_global_files() {
        let (_tmp, cfg) = global_with(&[("netrc", "{{ env \"SHARED\" }}")]);
        let work = tempfile::tempdir().unwrap();
        let a = project_dir(work.path(), "aaa", &[]);
        let b = project_dir(work.path(), "bbb", &[]);

        let m = manager(&cfg);
        m.activate(&a, env(&[("SHARED", "from-a")]), 0).unwrap();
        m.activate(&b, env(&[("SHARED", "from-b")]), 0).unwrap();

        let eff = m.effective();
        // Alphabetical dir order, last wins: bbb.
        assert_eq!(
            eff["netrc"].env.as_ref().unwrap().get("SHARED").map(String::as_str),
            Some("from-b")
        );
    }

    #[test]
    fn untrusted_project_config_fails_activation() {
        let (_tmp, cfg) = global_with(&[]);
        let work = tempfile::tempdir().unwrap();
        let proj = project_dir(work.path(), "proj", &[("netrc", &[])]);

        let trust_dir = tempfile::tempdir().unwrap();
        let trust = Arc::new(TrustStore::new(trust_dir.path().join("trusted.json")));

        let m = manager(&cfg);
        m.set_trust_store(Arc::clone(&trust));

        let err = m.activate(&proj, env(&[]), 0).unwrap_err();
        assert!(err.to_string().contains("untrusted"));
        assert!(m.activations().is_empty());

        trust.allow(&proj.join(".slinky.toml")).unwrap();
        let names = m.activate(&proj, env(&[]), 0).unwrap();
        assert_eq!(names, vec!["netrc".to_string()]);
    }

    #[test]
    fn update_global_fires_only_on_actual_change() {
        let (_tmp, cfg) = global_with(&[("netrc", "x")]);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        let m = ContextManager::new(
            &cfg,
            cfg.project_config_names(),
            Some(Box::new(move |_| {
                fired_cb.fetch_add(1, Ordering::SeqCst);
            })),
        );

        // Identical global: no callback.
        m.update_global(&cfg, cfg.project_config_names());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Changed global: callback fires.
        let (_tmp2, cfg2) = global_with(&[("netrc", "x"), ("npmrc", "y")]);
        m.update_global(&cfg2, cfg2.project_config_names());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(m.effective().len(), 2);
    }

    #[test]
    fn discover_layers_shallowest_first_first_name_wins() {
        let work = tempfile::tempdir().unwrap();
        let root = work.path();
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::write(root.join("a/.slinky.toml"), "").unwrap();
        // Both names exist at the deepest level; the first in the probe
        // list wins.
        std::fs::write(root.join("a/b/.slinky.toml"), "").unwrap();
        std::fs::write(root.join("a/b/slinky.toml"), "").unwrap();

        let names = Config::default().project_config_names();
        let paths = discover_layers(&root.join("a/b"), &names);

        assert_eq!(paths.len(), 2);
        let idx_a = paths
            .iter()
            .position(|p| p.ends_with("a/.slinky.toml"))
            .unwrap();
        let idx_ab = paths
            .iter()
            .position(|p| p.ends_with("b/.slinky.toml"))
            .unwrap();
        assert!(idx_a < idx_ab, "shallowest first");
        assert!(!paths.iter().any(|p| p.ends_with("b/slinky.toml")));
    }

    #[test]
    fn refresh_activation_picks_up_changed_layers() {
        let (_tmp, cfg) = global_with(&[]);
        let work = tempfile::tempdir().unwrap();
        let proj = project_dir(work.path(), "proj", &[("netrc", &[])]);

        let m = manager(&cfg);
        m.activate(&proj, env(&[]), 300).unwrap();
        assert_eq!(m.effective().len(), 1);

        // The project config grows a second file on disk.
        std::fs::write(proj.join("npmrc.tpl"), "x").unwrap();
        std::fs::write(
            proj.join(".slinky.toml"),
            "[files.netrc]\ntemplate = \"netrc.tpl\"\n\n[files.npmrc]\ntemplate = \"npmrc.tpl\"\n",
        )
        .unwrap();

        m.refresh_activation(&proj).unwrap();
        let eff = m.effective();
        assert_eq!(eff.len(), 2);
        assert!(eff.contains_key("npmrc"));
        // Sessions survive the in-place rebuild.
        assert_eq!(m.sessions().values().next().unwrap(), &vec![300]);

        // Refreshing an unknown dir is a no-op.
        m.refresh_activation(Path::new("/not/active")).unwrap();
        assert_eq!(m.effective().len(), 2);
    }

    #[test]
    fn reactivation_preserves_existing_sessions() {
        let (_tmp, cfg) = global_with(&[]);
        let work = tempfile::tempdir().unwrap();
        let proj = project_dir(work.path(), "proj", &[("netrc", &[])]);

        let m = manager(&cfg);
        m.activate(&proj, env(&[]), 10).unwrap();
        m.activate(&proj, env(&[]), 20).unwrap();

        let sessions = m.sessions();
        let pids = sessions.values().next().unwrap();
        assert_eq!(pids, &vec![10, 20]);
    }
}

//! Secret resolution: fingerprinting, cache strategy, deduplicated refresh.
//!
//! `resolve` is the single entry point backends use to turn a file name
//! into rendered bytes.  The cache is consulted by fingerprint: fresh
//! entries decrypt and return, stale entries return immediately while a
//! background refresh re-renders, misses render synchronously.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error};

use crate::SecretBytes;
use crate::cache::SecretCache;
use crate::cipher::CipherError;
use crate::config::{CurrentConfig, FileConfig};
use crate::context::ContextManager;
use crate::digest::hex;
use crate::paths::expand_path;
use crate::render::{EnvLookup, RenderError, process_env_lookup, renderer_for};

/// Domain separator between the render-input hash and the env pairs.
const ENV_SEPARATOR: &[u8] = b"\x00\x00slinky:env\x00\x00";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unknown file: {0:?}")]
    UnknownFile(String),
    #[error("computing cache key for {name:?}: {source}")]
    CacheKey {
        name: String,
        source: std::io::Error,
    },
    #[error("rendering {name:?}: {source}")]
    Render { name: String, source: RenderError },
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// Fingerprint-derived cache key: SHA-256 over the render inputs plus the
/// captured env, paired with the logical file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub hash: [u8; 32],
    pub name: String,
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", hex(&self.hash), self.name)
    }
}

/// Derive the cache key for a file: SHA-256 of the template file contents
/// (or NUL-joined command+args for command mode), then a domain separator,
/// then the sorted `K=V\0` env pairs.  Any template change, command change,
/// or env value change produces a different key.
pub fn compute_cache_key(
    name: &str,
    fc: &FileConfig,
    env: Option<&HashMap<String, String>>,
) -> Result<CacheKey, std::io::Error> {
    let mut hasher = Sha256::new();

    if let Some(template) = fc.template.as_deref().filter(|t| !t.is_empty()) {
        let path = expand_path(template);
        let content = std::fs::read(&path)?;
        hasher.update(&content);
    } else {
        let mut parts: Vec<&str> = Vec::with_capacity(1 + fc.args.len());
        parts.push(fc.command.as_deref().unwrap_or(""));
        parts.extend(fc.args.iter().map(String::as_str));
        hasher.update(parts.join("\x00").as_bytes());
    }

    if let Some(env) = env
        && !env.is_empty()
    {
        hasher.update(ENV_SEPARATOR);
        let mut keys: Vec<&String> = env.keys().collect();
        keys.sort();
        for key in keys {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(env[key].as_bytes());
            hasher.update(b"\x00");
        }
    }

    Ok(CacheKey {
        hash: hasher.finalize().into(),
        name: name.to_string(),
    })
}

pub struct SecretResolver {
    config: CurrentConfig,
    cache: Arc<SecretCache>,
    context: Option<Arc<ContextManager>>,
    /// File names with a refresh in flight; insert-if-absent decides refresh
    /// ownership.
    refreshing: Mutex<HashSet<String>>,
}

impl SecretResolver {
    pub fn new(
        config: CurrentConfig,
        cache: Arc<SecretCache>,
        context: Option<Arc<ContextManager>>,
    ) -> Self {
        Self {
            config,
            cache,
            context,
            refreshing: Mutex::new(HashSet::new()),
        }
    }

    /// Rendered content for the named file.
    ///
    /// Cache strategy:
    ///   - fresh hit: decrypt and return
    ///   - stale hit: return the cached plaintext, kick off one async
    ///     re-render (skipped if one is already in flight for this name)
    ///   - miss: render synchronously, cache, return
    pub async fn resolve(self: &Arc<Self>, name: &str) -> Result<SecretBytes, ResolveError> {
        let (fc, env, env_lookup) = self.lookup(name)?;

        let key = compute_cache_key(name, &fc, env.as_ref()).map_err(|source| {
            ResolveError::CacheKey {
                name: name.to_string(),
                source,
            }
        })?;
        let key_str = key.to_string();

        if let Some(entry) = self.cache.get(&key_str) {
            if entry.fresh() {
                debug!(file = name, "cache hit (fresh)");
                return Ok(self.cache.decrypt(&entry)?);
            }
            if entry.stale() {
                debug!(file = name, "cache hit (stale), async refresh");
                self.spawn_refresh(name, Arc::clone(&fc), env.clone(), key_str.clone());
                return Ok(self.cache.decrypt(&entry)?);
            }
        }

        debug!(file = name, "cache miss, rendering");
        self.render_and_cache(name, &fc, env, env_lookup, &key_str)
            .await
    }

    /// Render without touching the cache (dry-run and debug paths).
    pub fn render_only(&self, name: &str) -> Result<SecretBytes, ResolveError> {
        let (fc, env, env_lookup) = self.lookup(name)?;
        let bytes = renderer_for(&fc)
            .render(name, &fc, &env_lookup, env.as_ref())
            .map_err(|source| ResolveError::Render {
                name: name.to_string(),
                source,
            })?;
        Ok(SecretBytes::new(bytes))
    }

    /// The file's render inputs: config, captured env, and lookup chain.
    /// Prefers the context manager's effective set; falls back to the
    /// global config's files.
    fn lookup(
        &self,
        name: &str,
    ) -> Result<(Arc<FileConfig>, Option<HashMap<String, String>>, EnvLookup), ResolveError> {
        if let Some(context) = &self.context
            && let Some(ef) = context.effective().remove(name)
        {
            let lookup = ef.env_lookup();
            return Ok((ef.file, ef.env, lookup));
        }

        let config = self.config.load();
        match config.files.get(name) {
            Some(fc) => Ok((Arc::clone(fc), None, process_env_lookup())),
            None => Err(ResolveError::UnknownFile(name.to_string())),
        }
    }

    async fn render_and_cache(
        self: &Arc<Self>,
        name: &str,
        fc: &Arc<FileConfig>,
        env: Option<HashMap<String, String>>,
        env_lookup: EnvLookup,
        key_str: &str,
    ) -> Result<SecretBytes, ResolveError> {
        let bytes = render_blocking(name.to_string(), Arc::clone(fc), env, env_lookup)
            .await
            .map_err(|source| ResolveError::Render {
                name: name.to_string(),
                source,
            })?;

        let ttl = fc.file_ttl(self.config.load().settings.cache.default_ttl);
        if let Err(e) = self.cache.put(key_str, &bytes, ttl) {
            // Caching failure is non-fatal; the rendered content still goes
            // back to the caller.
            error!(file = name, error = %e, "failed to cache rendered content");
        }

        Ok(SecretBytes::new(bytes))
    }

    fn spawn_refresh(
        self: &Arc<Self>,
        name: &str,
        fc: Arc<FileConfig>,
        env: Option<HashMap<String, String>>,
        key_str: String,
    ) {
        {
            let mut refreshing = self
                .refreshing
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !refreshing.insert(name.to_string()) {
                return; // one refresh per name at a time
            }
        }

        let resolver = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            let env_lookup = crate::render::layered_env_lookup(env.clone());
            let result =
                render_blocking(name.clone(), Arc::clone(&fc), env, env_lookup).await;

            match result {
                Ok(bytes) => {
                    let ttl = fc.file_ttl(resolver.config.load().settings.cache.default_ttl);
                    if let Err(e) = resolver.cache.put(&key_str, &bytes, ttl) {
                        error!(file = name, error = %e, "async refresh cache put failed");
                    } else {
                        debug!(file = name, "async refresh completed");
                    }
                }
                Err(e) => error!(file = name, error = %e, "async refresh failed"),
            }

            resolver
                .refreshing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&name);
        });
    }
}

/// Run the (blocking) renderer on the blocking pool.
async fn render_blocking(
    name: String,
    fc: Arc<FileConfig>,
    env: Option<HashMap<String, String>>,
    env_lookup: EnvLookup,
) -> Result<Vec<u8>, RenderError> {
    let name_for_err = name.clone();
    tokio::task::spawn_blocking(move || {
        renderer_for(&fc).render(&name, &fc, &env_lookup, env.as_ref())
    })
    .await
    .unwrap_or_else(|join_err| {
        Err(RenderError::Command {
            command: name_for_err,
            message: format!("render task failed: {join_err}"),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::Ephemeral;
    use crate::config::{Config, RenderMode};
    use std::path::Path;
    use std::time::Duration;

    fn env_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn command_file(cmd: &str, args: &[&str]) -> Arc<FileConfig> {
        Arc::new(FileConfig {
            render: RenderMode::Command,
            command: Some(cmd.to_string()),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..FileConfig::default()
        })
    }

    fn resolver_with(
        files: &[(&str, Arc<FileConfig>)],
        default_ttl: Duration,
    ) -> Arc<SecretResolver> {
        let mut cfg = Config::default();
        cfg.settings.cache.default_ttl = default_ttl;
        for (name, fc) in files {
            cfg.files.insert(name.to_string(), Arc::clone(fc));
        }
        Arc::new(SecretResolver::new(
            CurrentConfig::new(Arc::new(cfg)),
            Arc::new(SecretCache::new(Box::new(Ephemeral::new()))),
            None,
        ))
    }

    // -- fingerprint ------------------------------------------------------

    #[test]
    fn cache_key_env_order_independent() {
        let fc = command_file("echo", &["x"]);
        let a = compute_cache_key("f", &fc, Some(&env_map(&[("A", "1"), ("B", "2")]))).unwrap();
        let b = compute_cache_key("f", &fc, Some(&env_map(&[("B", "2"), ("A", "1")]))).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn cache_key_sensitive_to_env_value() {
        let fc = command_file("echo", &["x"]);
        let a = compute_cache_key("f", &fc, Some(&env_map(&[("A", "1")]))).unwrap();
        let b = compute_cache_key("f", &fc, Some(&env_map(&[("A", "2")]))).unwrap();
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn cache_key_sensitive_to_command_and_args() {
        let a = compute_cache_key("f", &command_file("echo", &["x"]), None).unwrap();
        let b = compute_cache_key("f", &command_file("echo", &["y"]), None).unwrap();
        let c = compute_cache_key("f", &command_file("printf", &["x"]), None).unwrap();
        assert_ne!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn cache_key_sensitive_to_template_content() {
        let dir = tempfile::tempdir().unwrap();
        let tpl = dir.path().join("t.tpl");

        std::fs::write(&tpl, "one").unwrap();
        let fc = Arc::new(FileConfig {
            template: Some(tpl.to_string_lossy().into_owned()),
            ..FileConfig::default()
        });
        let a = compute_cache_key("f", &fc, None).unwrap();

        std::fs::write(&tpl, "two").unwrap();
        let b = compute_cache_key("f", &fc, None).unwrap();
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn cache_key_string_is_hex_colon_name() {
        let key = compute_cache_key("docker/config.json", &command_file("echo", &[]), None)
            .unwrap();
        let s = key.to_string();
        assert_eq!(s.len(), 64 + 1 + "docker/config.json".len());
        assert!(s.ends_with(":docker/config.json"));
    }

    #[test]
    fn cache_key_missing_template_is_io_error() {
        let fc = Arc::new(FileConfig {
            template: Some("/nonexistent/t.tpl".to_string()),
            ..FileConfig::default()
        });
        assert!(compute_cache_key("f", &fc, None).is_err());
    }

    // -- resolve ----------------------------------------------------------

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_file_errors() {
        let r = resolver_with(&[], Duration::from_secs(60));
        assert!(matches!(
            r.resolve("ghost").await,
            Err(ResolveError::UnknownFile(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn miss_renders_and_caches() {
        let r = resolver_with(
            &[("greeting", command_file("sh", &["-c", "printf hello"]))],
            Duration::from_secs(60),
        );

        let out = r.resolve("greeting").await.unwrap();
        assert_eq!(out.as_slice(), b"hello");

        // Second resolve is served from cache (still same content).
        let out = r.resolve("greeting").await.unwrap();
        assert_eq!(out.as_slice(), b"hello");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn render_only_bypasses_cache() {
        let r = resolver_with(
            &[("g", command_file("sh", &["-c", "printf x"]))],
            Duration::from_secs(60),
        );
        let out = r.render_only("g").unwrap();
        assert_eq!(out.as_slice(), b"x");

        let key = compute_cache_key("g", &command_file("sh", &["-c", "printf x"]), None).unwrap();
        assert!(r.cache.get(&key.to_string()).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_hit_returns_previous_and_refreshes_once() {
        // S5 + property 7.  The command appends a marker line per render;
        // the file line count observes how many renders actually ran.
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("renders.log");
        let script = format!("echo r >> {}; printf content", log.display());
        let fc = command_file("sh", &["-c", &script]);

        let r = resolver_with(&[("x", Arc::clone(&fc))], Duration::from_millis(200));

        let out = r.resolve("x").await.unwrap();
        assert_eq!(out.as_slice(), b"content");
        let key = compute_cache_key("x", &fc, None).unwrap().to_string();
        let first = r.cache.get(&key).unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;

        // Two rapid stale reads: both return synchronously, at most one
        // refresh runs.
        let out = r.resolve("x").await.unwrap();
        assert_eq!(out.as_slice(), b"content");
        let out = r.resolve("x").await.unwrap();
        assert_eq!(out.as_slice(), b"content");

        // Wait for the background refresh to land a newer entry.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(entry) = r.cache.get(&key)
                && entry.created_at > first.created_at
            {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "refresh never replaced the stale entry"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let renders = std::fs::read_to_string(&log).unwrap().lines().count();
        assert_eq!(renders, 2, "initial render + exactly one refresh");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn render_failure_surfaces_per_file() {
        let r = resolver_with(
            &[
                ("bad", command_file("sh", &["-c", "exit 7"])),
                ("good", command_file("sh", &["-c", "printf ok"])),
            ],
            Duration::from_secs(60),
        );

        assert!(matches!(
            r.resolve("bad").await,
            Err(ResolveError::Render { .. })
        ));
        // Another file's failure never affects this one.
        assert_eq!(r.resolve("good").await.unwrap().as_slice(), b"ok");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_prefers_effective_set() {
        // A context manager with a project override supplies both the file
        // config and the captured env.
        let work = tempfile::tempdir().unwrap();
        let proj = work.path().join("proj");
        std::fs::create_dir_all(&proj).unwrap();
        std::fs::write(proj.join("t.tpl"), "token={{ env \"TOK\" }}").unwrap();
        std::fs::write(
            proj.join(".slinky.toml"),
            "[files.cred]\ntemplate = \"t.tpl\"\n",
        )
        .unwrap();

        let cfg = Config::default();
        let ctx = Arc::new(ContextManager::new(&cfg, cfg.project_config_names(), None));
        ctx.activate(&proj, env_map(&[("TOK", "sekrit")]), 0).unwrap();

        let r = Arc::new(SecretResolver::new(
            CurrentConfig::new(Arc::new(cfg)),
            Arc::new(SecretCache::new(Box::new(Ephemeral::new()))),
            Some(ctx),
        ));

        let out = r.resolve("cred").await.unwrap();
        assert_eq!(out.as_slice(), b"token=sekrit");
    }
}

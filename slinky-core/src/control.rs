//! Control protocol: a same-UID Unix socket carrying one JSON object per
//! line.
//!
//! Shell hooks and front-ends use the client to switch the active secret
//! context; the daemon answers activation, status, and cache inspection
//! requests.  Connections from other UIDs are dropped before any shared
//! state is touched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::SecretCache;
use crate::context::{ContextManager, EffectiveFile};
use crate::paths::state_dir;
use crate::render::renderer_for;

pub const PROTOCOL_VERSION: u32 = 1;

/// Handler tasks running at once; further connections are rejected.
const MAX_CONCURRENT_HANDLERS: usize = 16;
/// Per-connection read/write deadline.
const IO_DEADLINE: Duration = Duration::from_secs(10);
/// Request payload cap.
const MAX_REQUEST_SIZE: u64 = 1 << 20;
/// Env entries accepted per activate request.
const MAX_ENV_ENTRIES: usize = 256;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("another slinky daemon is already listening on {0:?}")]
    AlreadyRunning(PathBuf),
    #[error("connecting to daemon at {path:?}: {source} (is the daemon running?)")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("parsing response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("reading response: connection closed")]
    ConnectionClosed,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dir: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    pub session: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivateResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeactivateResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub running: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config_hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_dirs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub layers: HashMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub sessions: HashMap<String, Vec<i32>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheEntryInfo {
    pub age: String,
    pub ttl: String,
    pub state: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStatsResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cipher: String,
    #[serde(default)]
    pub entries: HashMap<String, CacheEntryInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheGetResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheClearResponse {
    #[serde(default)]
    pub ok: bool,
}

/// `$XDG_STATE_HOME/slinky/ctl`.
pub fn default_socket_path() -> PathBuf {
    state_dir().join("ctl")
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub type ConfigHashFn = Box<dyn Fn() -> String + Send + Sync>;
/// Peer-UID probe, injectable for tests.
pub type UidProbe = Box<dyn Fn(&UnixStream) -> std::io::Result<u32> + Send + Sync>;

pub struct ControlServer {
    socket_path: PathBuf,
    context: Arc<ContextManager>,
    cache: Mutex<Option<Arc<SecretCache>>>,
    config_hash: Mutex<Option<ConfigHashFn>>,
    uid_probe: UidProbe,
    listener: Mutex<Option<UnixListener>>,
    sem: Arc<tokio::sync::Semaphore>,
}

impl ControlServer {
    pub fn new(socket_path: Option<PathBuf>, context: Arc<ContextManager>) -> Self {
        Self {
            socket_path: socket_path.unwrap_or_else(default_socket_path),
            context,
            cache: Mutex::new(None),
            config_hash: Mutex::new(None),
            uid_probe: Box::new(|stream| stream.peer_cred().map(|cred| cred.uid())),
            listener: Mutex::new(None),
            sem: Arc::new(tokio::sync::Semaphore::new(MAX_CONCURRENT_HANDLERS)),
        }
    }

    /// Attach the cache for the cache_* commands.
    pub fn set_cache(&self, cache: Arc<SecretCache>) {
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = Some(cache);
    }

    /// Attach the running-config hash for staleness detection by clients.
    pub fn set_config_hash_fn(&self, f: ConfigHashFn) {
        *self
            .config_hash
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(f);
    }

    /// Replace the peer-UID probe (tests).
    pub fn set_uid_probe(&mut self, probe: UidProbe) {
        self.uid_probe = probe;
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket.  A live daemon on the path is an error; a dead
    /// socket file is removed and rebound.
    pub async fn listen(&self) -> Result<(), ControlError> {
        if let Some(dir) = self.socket_path.parent() {
            use std::os::unix::fs::PermissionsExt as _;
            std::fs::create_dir_all(dir)?;
            let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700));
        }

        if self.socket_path.exists() {
            match tokio::time::timeout(
                Duration::from_secs(2),
                UnixStream::connect(&self.socket_path),
            )
            .await
            {
                Ok(Ok(_)) => {
                    return Err(ControlError::AlreadyRunning(self.socket_path.clone()));
                }
                _ => {
                    info!(path = %self.socket_path.display(), "removing stale control socket");
                    let _ = std::fs::remove_file(&self.socket_path);
                }
            }
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        *self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
        Ok(())
    }

    /// Accept and dispatch connections until cancelled.  Calls
    /// [`listen`](Self::listen) if it has not run yet.
    pub async fn serve(self: Arc<Self>, token: CancellationToken) -> Result<(), ControlError> {
        if self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
        {
            self.listen().await?;
        }
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .expect("listener bound above");

        info!(path = %self.socket_path.display(), "control socket listening");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    drop(listener);
                    let _ = std::fs::remove_file(&self.socket_path);
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, _addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "accept error");
                            continue;
                        }
                    };
                    match Arc::clone(&self.sem).try_acquire_owned() {
                        Ok(permit) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.handle_conn(stream).await;
                                drop(permit);
                            });
                        }
                        Err(_) => {
                            warn!("too many concurrent connections, rejecting");
                            drop(stream);
                        }
                    }
                }
            }
        }
    }

    async fn handle_conn(&self, stream: UnixStream) {
        // Peer check before any shared state is touched.
        let my_uid = unsafe { libc::getuid() };
        match (self.uid_probe)(&stream) {
            Ok(uid) if uid == my_uid => {}
            Ok(uid) => {
                warn!(peer_uid = uid, daemon_uid = my_uid, "rejecting connection: peer UID mismatch");
                return;
            }
            Err(e) => {
                warn!(error = %e, "rejecting connection: peer credential check failed");
                return;
            }
        }

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half.take(MAX_REQUEST_SIZE));

        let mut line = String::new();
        match tokio::time::timeout(IO_DEADLINE, reader.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 => {}
            _ => return,
        }

        let req: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                error!(error = %e, "invalid request");
                let resp = ActivateResponse {
                    error: Some("invalid JSON".to_string()),
                    ..ActivateResponse::default()
                };
                write_json(&mut write_half, &resp).await;
                return;
            }
        };

        if req.version != 0 && req.version != PROTOCOL_VERSION {
            warn!(
                version = req.version,
                expected = PROTOCOL_VERSION,
                "unknown protocol version, processing anyway"
            );
        }

        match req.kind.as_str() {
            "activate" => {
                let resp = self.handle_activate(req);
                write_json(&mut write_half, &resp).await;
            }
            "deactivate" => {
                let resp = self.handle_deactivate(req);
                write_json(&mut write_half, &resp).await;
            }
            "status" => {
                let resp = self.handle_status();
                write_json(&mut write_half, &resp).await;
            }
            "cache_stats" => {
                let resp = self.handle_cache_stats();
                write_json(&mut write_half, &resp).await;
            }
            "cache_get" => {
                let resp = self.handle_cache_get(req);
                write_json(&mut write_half, &resp).await;
            }
            "cache_clear" => {
                if let Some(cache) = self.cache() {
                    cache.clear();
                }
                write_json(&mut write_half, &CacheClearResponse { ok: true }).await;
            }
            other => {
                let resp = ActivateResponse {
                    error: Some(format!("unknown request type: {other:?}")),
                    ..ActivateResponse::default()
                };
                write_json(&mut write_half, &resp).await;
            }
        }
    }

    fn handle_activate(&self, req: Request) -> ActivateResponse {
        if req.env.len() > MAX_ENV_ENTRIES {
            warn!(count = req.env.len(), max = MAX_ENV_ENTRIES, "activate rejected: too many env entries");
            return ActivateResponse {
                error: Some(format!(
                    "too many env entries ({} > {MAX_ENV_ENTRIES})",
                    req.env.len()
                )),
                ..ActivateResponse::default()
            };
        }

        let prev_eff = self.context.effective();

        let names = match self.context.activate(Path::new(&req.dir), req.env, req.session) {
            Ok(names) => names,
            Err(e) => {
                warn!(dir = req.dir, error = %e, "activation failed");
                return ActivateResponse {
                    error: Some(e.to_string()),
                    ..ActivateResponse::default()
                };
            }
        };

        // Probe-render only files whose render inputs actually changed, so
        // a bad template warns instead of blocking the directory switch.
        let mut warnings = Vec::new();
        for (name, ef) in self.context.effective() {
            if ef.file.symlink.is_none() {
                continue;
            }
            if !effective_file_changed(prev_eff.get(&name), &ef) {
                continue;
            }
            let env_lookup = ef.env_lookup();
            if let Err(e) =
                renderer_for(&ef.file).render(&name, &ef.file, &env_lookup, ef.env.as_ref())
            {
                warn!(file = name, error = %e, "render probe failed");
                warnings.push(format!("file {name:?}: render failed: {e}"));
            }
        }

        info!(
            dir = req.dir,
            session = req.session,
            files = names.len(),
            warnings = warnings.len(),
            "context activated"
        );
        ActivateResponse {
            ok: true,
            files: names,
            warnings,
            error: None,
        }
    }

    fn handle_deactivate(&self, req: Request) -> DeactivateResponse {
        let names = self.context.deactivate(Path::new(&req.dir), req.session);
        info!(dir = req.dir, session = req.session, files = names.len(), "context deactivated");
        DeactivateResponse {
            ok: true,
            files: names,
            error: None,
        }
    }

    fn handle_status(&self) -> StatusResponse {
        let eff = self.context.effective();
        let files: Vec<String> = eff.into_keys().collect();

        let activations = self.context.activations();
        let active_dirs: Vec<String> = activations.keys().cloned().collect();
        let layers: HashMap<String, Vec<String>> = activations
            .iter()
            .map(|(dir, act)| (dir.clone(), act.layer_dirs()))
            .collect();

        let config_hash = self
            .config_hash
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|f| f())
            .unwrap_or_default();

        StatusResponse {
            running: true,
            config_hash,
            active_dirs,
            files,
            layers,
            sessions: self.context.sessions(),
        }
    }

    fn handle_cache_stats(&self) -> CacheStatsResponse {
        let Some(cache) = self.cache() else {
            return CacheStatsResponse::default();
        };

        let entries = cache
            .stats()
            .into_iter()
            .map(|(key, info)| {
                (
                    key,
                    CacheEntryInfo {
                        age: humantime::format_duration(truncate_secs(info.age)).to_string(),
                        ttl: humantime::format_duration(truncate_secs(info.ttl)).to_string(),
                        state: info.state.to_string(),
                    },
                )
            })
            .collect();

        CacheStatsResponse {
            ok: true,
            cipher: cache.cipher_name().to_string(),
            entries,
        }
    }

    fn handle_cache_get(&self, req: Request) -> CacheGetResponse {
        if req.key.is_empty() {
            return CacheGetResponse {
                error: Some("missing key".to_string()),
                ..CacheGetResponse::default()
            };
        }
        let Some(cache) = self.cache() else {
            return CacheGetResponse {
                key: req.key,
                error: Some("cache not available".to_string()),
                ..CacheGetResponse::default()
            };
        };

        let Some(entry) = cache.get(&req.key) else {
            return CacheGetResponse {
                key: req.key,
                error: Some("not found".to_string()),
                ..CacheGetResponse::default()
            };
        };

        match cache.decrypt(&entry) {
            Ok(plaintext) => CacheGetResponse {
                ok: true,
                key: req.key,
                value: String::from_utf8_lossy(plaintext.as_slice()).into_owned(),
                error: None,
            },
            Err(e) => CacheGetResponse {
                key: req.key,
                error: Some(format!("decrypt: {e}")),
                ..CacheGetResponse::default()
            },
        }
    }

    fn cache(&self) -> Option<Arc<SecretCache>> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Whether the file's render inputs differ between two effective views.
fn effective_file_changed(prev: Option<&EffectiveFile>, cur: &EffectiveFile) -> bool {
    match prev {
        None => true, // new file
        Some(prev) => !Arc::ptr_eq(&prev.file, &cur.file) || prev.env != cur.env,
    }
}

fn truncate_secs(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs())
}

async fn write_json<T: Serialize>(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    value: &T,
) {
    let mut data = match serde_json::to_vec(value) {
        Ok(data) => data,
        Err(e) => {
            error!(error = %e, "failed to marshal response");
            return;
        }
    };
    data.push(b'\n');
    match tokio::time::timeout(IO_DEADLINE, write_half.write_all(&data)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "failed to write response"),
        Err(_) => error!("timed out writing response"),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Blocking client for the control protocol, used by front-ends and tests.
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: Option<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.unwrap_or_else(default_socket_path),
        }
    }

    pub fn activate(
        &self,
        dir: &str,
        env: HashMap<String, String>,
        session: i32,
    ) -> Result<ActivateResponse, ControlError> {
        self.round_trip(&Request {
            version: PROTOCOL_VERSION,
            kind: "activate".to_string(),
            dir: dir.to_string(),
            env,
            session,
            ..Request::default()
        })
    }

    pub fn deactivate(&self, dir: &str, session: i32) -> Result<DeactivateResponse, ControlError> {
        self.round_trip(&Request {
            version: PROTOCOL_VERSION,
            kind: "deactivate".to_string(),
            dir: dir.to_string(),
            session,
            ..Request::default()
        })
    }

    pub fn status(&self) -> Result<StatusResponse, ControlError> {
        self.round_trip(&Request {
            version: PROTOCOL_VERSION,
            kind: "status".to_string(),
            ..Request::default()
        })
    }

    pub fn cache_stats(&self) -> Result<CacheStatsResponse, ControlError> {
        self.round_trip(&Request {
            version: PROTOCOL_VERSION,
            kind: "cache_stats".to_string(),
            ..Request::default()
        })
    }

    pub fn cache_get(&self, key: &str) -> Result<CacheGetResponse, ControlError> {
        self.round_trip(&Request {
            version: PROTOCOL_VERSION,
            kind: "cache_get".to_string(),
            key: key.to_string(),
            ..Request::default()
        })
    }

    pub fn cache_clear(&self) -> Result<CacheClearResponse, ControlError> {
        self.round_trip(&Request {
            version: PROTOCOL_VERSION,
            kind: "cache_clear".to_string(),
            ..Request::default()
        })
    }

    fn round_trip<T: serde::de::DeserializeOwned>(
        &self,
        req: &Request,
    ) -> Result<T, ControlError> {
        use std::io::{BufRead, BufReader as StdBufReader, Write};

        let stream = std::os::unix::net::UnixStream::connect(&self.socket_path).map_err(
            |source| ControlError::Connect {
                path: self.socket_path.clone(),
                source,
            },
        )?;
        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        stream.set_write_timeout(Some(Duration::from_secs(30)))?;

        let mut data = serde_json::to_vec(req)?;
        data.push(b'\n');
        (&stream).write_all(&data)?;

        let mut reader = StdBufReader::new(&stream);
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Err(ControlError::ConnectionClosed);
        }
        Ok(serde_json::from_str(&line)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::Ephemeral;
    use crate::config::Config;
    use std::time::Duration;

    fn test_context() -> Arc<ContextManager> {
        let cfg = Config::default();
        Arc::new(ContextManager::new(&cfg, cfg.project_config_names(), None))
    }

    async fn start_server(server: Arc<ControlServer>) -> CancellationToken {
        server.listen().await.unwrap();
        let token = CancellationToken::new();
        let serve_token = token.clone();
        tokio::spawn(async move {
            let _ = server.serve(serve_token).await;
        });
        token
    }

    fn sock(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("ctl")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(ControlServer::new(Some(sock(&dir)), test_context()));
        server.set_config_hash_fn(Box::new(|| "deadbeef".to_string()));
        let token = start_server(Arc::clone(&server)).await;

        let client = ControlClient::new(Some(sock(&dir)));
        let status = tokio::task::spawn_blocking(move || client.status())
            .await
            .unwrap()
            .unwrap();
        assert!(status.running);
        assert_eq!(status.config_hash, "deadbeef");
        token.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn activate_and_deactivate_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let proj = dir.path().join("proj");
        std::fs::create_dir_all(&proj).unwrap();
        std::fs::write(proj.join("t.tpl"), "x").unwrap();
        std::fs::write(proj.join(".slinky.toml"), "[files.netrc]\ntemplate = \"t.tpl\"\n")
            .unwrap();

        let server = Arc::new(ControlServer::new(Some(sock(&dir)), test_context()));
        let token = start_server(Arc::clone(&server)).await;

        let proj_str = proj.to_string_lossy().into_owned();

        let sock_path = sock(&dir);
        let proj_activate = proj_str.clone();
        let resp = tokio::task::spawn_blocking(move || {
            ControlClient::new(Some(sock_path)).activate(&proj_activate, HashMap::new(), 4242)
        })
        .await
        .unwrap()
        .unwrap();
        assert!(resp.ok, "error: {:?}", resp.error);
        assert_eq!(resp.files, vec!["netrc".to_string()]);

        let sock_path = sock(&dir);
        let status = tokio::task::spawn_blocking(move || {
            ControlClient::new(Some(sock_path)).status()
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(status.active_dirs.len(), 1);
        assert_eq!(status.sessions.values().next().unwrap(), &vec![4242]);

        let sock_path = sock(&dir);
        let resp = tokio::task::spawn_blocking(move || {
            ControlClient::new(Some(sock_path)).deactivate(&proj_str, 4242)
        })
        .await
        .unwrap()
        .unwrap();
        assert!(resp.ok);
        assert!(resp.files.is_empty());
        token.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cache_commands_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(SecretCache::new(Box::new(Ephemeral::new())));
        cache.put("k:file", b"secret-value", Duration::from_secs(60)).unwrap();

        let server = Arc::new(ControlServer::new(Some(sock(&dir)), test_context()));
        server.set_cache(Arc::clone(&cache));
        let token = start_server(Arc::clone(&server)).await;

        let sock_path = sock(&dir);
        let stats = tokio::task::spawn_blocking(move || {
            ControlClient::new(Some(sock_path)).cache_stats()
        })
        .await
        .unwrap()
        .unwrap();
        assert!(stats.ok);
        assert_eq!(stats.cipher, "ephemeral");
        assert_eq!(stats.entries["k:file"].state, "fresh");

        let sock_path = sock(&dir);
        let got = tokio::task::spawn_blocking(move || {
            ControlClient::new(Some(sock_path)).cache_get("k:file")
        })
        .await
        .unwrap()
        .unwrap();
        assert!(got.ok);
        assert_eq!(got.value, "secret-value");

        let sock_path = sock(&dir);
        let cleared = tokio::task::spawn_blocking(move || {
            ControlClient::new(Some(sock_path)).cache_clear()
        })
        .await
        .unwrap()
        .unwrap();
        assert!(cleared.ok);
        assert!(cache.stats().is_empty());

        let sock_path = sock(&dir);
        let got = tokio::task::spawn_blocking(move || {
            ControlClient::new(Some(sock_path)).cache_get("k:file")
        })
        .await
        .unwrap()
        .unwrap();
        assert!(!got.ok);
        assert_eq!(got.error.as_deref(), Some("not found"));
        token.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn peer_uid_mismatch_drops_connection() {
        // Property 12: a foreign-UID connection is closed with no state
        // change and no response.
        let dir = tempfile::tempdir().unwrap();
        let context = test_context();
        let mut server = ControlServer::new(Some(sock(&dir)), Arc::clone(&context));
        server.set_uid_probe(Box::new(|_| Ok(u32::MAX)));
        let server = Arc::new(server);
        let token = start_server(Arc::clone(&server)).await;

        let sock_path = sock(&dir);
        let result = tokio::task::spawn_blocking(move || {
            ControlClient::new(Some(sock_path)).status()
        })
        .await
        .unwrap();
        assert!(matches!(
            result,
            Err(ControlError::ConnectionClosed) | Err(ControlError::Io(_))
        ));
        assert!(context.activations().is_empty());
        token.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn env_cap_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(ControlServer::new(Some(sock(&dir)), test_context()));
        let token = start_server(Arc::clone(&server)).await;

        let mut env = HashMap::new();
        for i in 0..300 {
            env.insert(format!("VAR_{i}"), "x".to_string());
        }
        let sock_path = sock(&dir);
        let resp = tokio::task::spawn_blocking(move || {
            ControlClient::new(Some(sock_path)).activate("/tmp", env, 0)
        })
        .await
        .unwrap()
        .unwrap();
        assert!(!resp.ok);
        assert!(resp.error.unwrap().contains("too many env entries"));
        token.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_listener_on_live_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(ControlServer::new(Some(sock(&dir)), test_context()));
        let token = start_server(Arc::clone(&server)).await;

        let other = ControlServer::new(Some(sock(&dir)), test_context());
        assert!(matches!(
            other.listen().await,
            Err(ControlError::AlreadyRunning(_))
        ));
        token.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        // A dead socket file nobody listens on.
        {
            let listener = std::os::unix::net::UnixListener::bind(sock(&dir)).unwrap();
            drop(listener);
        }
        assert!(sock(&dir).exists());

        let server = Arc::new(ControlServer::new(Some(sock(&dir)), test_context()));
        server.listen().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_request_type_gets_error() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(ControlServer::new(Some(sock(&dir)), test_context()));
        let token = start_server(Arc::clone(&server)).await;

        let sock_path = sock(&dir);
        let resp: ActivateResponse = tokio::task::spawn_blocking(move || {
            let client = ControlClient::new(Some(sock_path));
            client.round_trip(&Request {
                version: PROTOCOL_VERSION,
                kind: "frobnicate".to_string(),
                ..Request::default()
            })
        })
        .await
        .unwrap()
        .unwrap();
        assert!(!resp.ok);
        assert!(resp.error.unwrap().contains("unknown request type"));
        token.cancel();
    }
}

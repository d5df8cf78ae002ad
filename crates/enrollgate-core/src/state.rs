use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::identity::{CallerId, Identity};
use crate::rate_limiter::WindowLimit;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("state file I/O error: {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("state file is not a JSON object")]
    NotAnObject,
    #[error("state persistence task failed: {0}")]
    Task(String),
}

/// The whole persistent admission state.
///
/// All four collections are read and written together under the
/// [`StateStore`] lock; nothing outside the store holds a mutable reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct State {
    /// Callers permanently denied. Grows only.
    pub banned: BTreeSet<CallerId>,
    /// Consecutive invalid submissions per caller since the last valid one.
    pub attempts: BTreeMap<CallerId, u32>,
    /// Request timestamps per identity, ascending.
    pub identity_requests: BTreeMap<String, Vec<i64>>,
    /// Request timestamps across all identities, ascending.
    pub global_requests: Vec<i64>,
}

impl State {
    pub fn is_banned(&self, caller: CallerId) -> bool {
        self.banned.contains(&caller)
    }

    pub fn attempts(&self, caller: CallerId) -> u32 {
        self.attempts.get(&caller).copied().unwrap_or(0)
    }

    /// Increment the caller's invalid-attempt counter and return the new value.
    pub fn record_invalid_attempt(&mut self, caller: CallerId) -> u32 {
        let count = self.attempts.entry(caller).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn clear_attempts(&mut self, caller: CallerId) {
        self.attempts.remove(&caller);
    }

    /// Add the caller to the ban list. Its attempt counter is dropped.
    pub fn ban(&mut self, caller: CallerId) {
        self.banned.insert(caller);
        self.attempts.remove(&caller);
    }

    /// Sliding-window check on the per-identity series.
    pub fn admit_identity(&mut self, identity: &Identity, now: i64, limit: &WindowLimit) -> bool {
        if !limit.is_enabled() {
            return true;
        }
        let history = self
            .identity_requests
            .entry(identity.as_str().to_string())
            .or_default();
        limit.allow(identity.as_str(), history, now)
    }

    /// Sliding-window check on the global series.
    pub fn admit_global(&mut self, now: i64, limit: &WindowLimit) -> bool {
        limit.allow("global", &mut self.global_requests, now)
    }

    /// Build state from a parsed JSON document, skipping anything malformed.
    pub fn from_json(payload: &Value) -> Result<Self, StateError> {
        let obj = payload.as_object().ok_or(StateError::NotAnObject)?;
        let mut state = State::default();

        if let Some(items) = obj.get("banned_chat_ids").and_then(Value::as_array) {
            state.banned = items.iter().filter_map(json_int).collect();
        }

        if let Some(map) = obj.get("invalid_identity_attempts").and_then(Value::as_object) {
            state.attempts = map
                .iter()
                .filter_map(|(k, v)| {
                    let caller = k.trim().parse::<CallerId>().ok()?;
                    let count = u32::try_from(json_int(v)?).ok()?;
                    Some((caller, count))
                })
                .collect();
        }

        if let Some(map) = obj.get("username_requests").and_then(Value::as_object) {
            state.identity_requests = map
                .iter()
                .filter_map(|(k, v)| {
                    let items = v.as_array()?;
                    Some((k.clone(), items.iter().filter_map(json_int).collect()))
                })
                .collect();
        }

        if let Some(items) = obj.get("global_requests").and_then(Value::as_array) {
            state.global_requests = items.iter().filter_map(json_int).collect();
        }

        Ok(state)
    }

    pub fn to_json(&self) -> Result<String, StateError> {
        let record = StateRecord {
            banned_chat_ids: &self.banned,
            invalid_identity_attempts: self
                .attempts
                .iter()
                .map(|(caller, count)| (caller.to_string(), *count))
                .collect(),
            username_requests: &self.identity_requests,
            global_requests: &self.global_requests,
        };
        Ok(serde_json::to_string_pretty(&record)?)
    }
}

/// On-disk layout of [`State`].
#[derive(Serialize)]
struct StateRecord<'a> {
    banned_chat_ids: &'a BTreeSet<CallerId>,
    invalid_identity_attempts: BTreeMap<String, u32>,
    username_requests: &'a BTreeMap<String, Vec<i64>>,
    global_requests: &'a [i64],
}

/// Integers may appear as JSON numbers or numeric strings.
fn json_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ── File persistence ──────────────────────────────────────────────────────────

/// Load state from `path`. Never fails: a missing, unreadable or corrupt file
/// yields empty state.
pub fn load(path: &Path) -> State {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no state file yet, starting empty");
            return State::default();
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read state file, starting empty");
            return State::default();
        }
    };

    let parsed = serde_json::from_str::<Value>(&text)
        .map_err(StateError::from)
        .and_then(|payload| State::from_json(&payload));

    match parsed {
        Ok(state) => {
            tracing::info!(
                path = %path.display(),
                banned = state.banned.len(),
                warned = state.attempts.len(),
                identities = state.identity_requests.len(),
                "state loaded"
            );
            state
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to parse state file, starting empty");
            State::default()
        }
    }
}

/// Write state to `path` through a sibling temp file and an atomic rename, so
/// a crash mid-write leaves the previous file intact.
pub fn save(path: &Path, state: &State) -> Result<(), StateError> {
    write_atomic(path, &state.to_json()?)
}

fn write_atomic(path: &Path, json: &str) -> Result<(), StateError> {
    let io_err = |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let tmp_path = temp_path(path);

    let mut file = fs::File::create(&tmp_path).map_err(io_err)?;
    file.write_all(json.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(io_err)?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// Single owner of the in-memory [`State`] and its backing file.
///
/// Every [`update`](Self::update) runs read-modify-persist inside one
/// critical section. A failed persist is logged and the in-memory change
/// stands, so decisions keep working even if the disk does not.
pub struct StateStore {
    path: PathBuf,
    state: Mutex<State>,
}

impl StateStore {
    /// Load the state file at `path` (or start empty) and take ownership of it.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = load(&path);
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a read-only closure against the current state.
    pub async fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let state = self.state.lock().await;
        f(&state)
    }

    /// Run a mutating closure and persist the result before releasing the lock.
    ///
    /// The file write runs on the blocking pool; the lock stays held until it
    /// completes, so the next decision always sees persisted state.
    pub async fn update<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().await;
        let result = f(&mut state);
        if let Err(e) = self.persist(&state).await {
            tracing::error!(
                path = %self.path.display(),
                error = %e,
                "failed to persist state, changes will not survive a restart"
            );
        }
        result
    }

    async fn persist(&self, state: &State) -> Result<(), StateError> {
        let json = state.to_json()?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &json))
            .await
            .map_err(|e| StateError::Task(e.to_string()))?
    }

    pub async fn snapshot(&self) -> State {
        self.state.lock().await.clone()
    }
}

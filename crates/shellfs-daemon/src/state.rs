//! Persistent local↔backend identity mapping.
//!
//! Conversations are keyed by an 8-hex local id and stored in a single JSON
//! file at `~/.shelley-fuse/state.json`:
//!
//! ```text
//! { "backends": { "main": { "url": "…", "conversations": { "<local_id>": { … } } } },
//!   "default_backend": "main" }
//! ```
//!
//! A legacy top-level `{"conversations":{…}}` file is migrated into the
//! `main` backend on load. Every mutation rewrites the file atomically
//! (write to temp, then rename) before the write lock is released.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{FsError, Result};

const DEFAULT_BACKEND: &str = "main";
const LOCAL_ID_LEN: usize = 8;
const CLONE_ATTEMPTS: usize = 100;

fn default_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// One conversation's persistent record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    #[serde(default)]
    pub local_id: String,
    /// Empty until the conversation exists on the backend.
    #[serde(default)]
    pub backend_id: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub model_display_name: String,
    #[serde(default)]
    pub model_api_id: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub created: bool,
    #[serde(default = "default_timestamp")]
    pub local_created_at: DateTime<Utc>,
    #[serde(default)]
    pub api_created_at: String,
    #[serde(default)]
    pub api_updated_at: String,
}

impl Default for ConversationRecord {
    fn default() -> Self {
        Self {
            local_id: String::new(),
            backend_id: String::new(),
            slug: String::new(),
            model_display_name: String::new(),
            model_api_id: String::new(),
            cwd: String::new(),
            created: false,
            local_created_at: Utc::now(),
            api_created_at: String::new(),
            api_updated_at: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BackendState {
    #[serde(default)]
    url: String,
    #[serde(default)]
    conversations: HashMap<String, ConversationRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    backends: HashMap<String, BackendState>,
    #[serde(default)]
    default_backend: String,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyStateFile {
    #[serde(default)]
    conversations: HashMap<String, ConversationRecord>,
}

/// Concurrent map of `local_id → ConversationRecord` with JSON persistence.
pub struct StateStore {
    path: PathBuf,
    inner: RwLock<StateFile>,
}

impl StateStore {
    /// Opens (or creates) the state file in the default directory,
    /// `~/.shelley-fuse`.
    pub fn open_default(backend_url: &str) -> Result<Self> {
        let dir = dirs::home_dir()
            .ok_or_else(|| FsError::Invariant("cannot determine home directory".to_string()))?
            .join(".shelley-fuse");
        Self::open(&dir, backend_url)
    }

    /// Opens (or creates) the state file in `dir`, migrating a legacy
    /// single-backend layout when one is found.
    pub fn open(dir: &Path, backend_url: &str) -> Result<Self> {
        // The layout guarantees 0755/0644 regardless of the process umask.
        fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o755))?;
        let path = dir.join("state.json");

        let mut state = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            Self::decode(&raw)?
        } else {
            StateFile::default()
        };

        if state.default_backend.is_empty() {
            state.default_backend = DEFAULT_BACKEND.to_string();
        }
        let backend = state
            .backends
            .entry(state.default_backend.clone())
            .or_default();
        backend.url = backend_url.to_string();
        // Normalise local_id from the map key; older files may lack it.
        for (key, record) in &mut backend.conversations {
            if record.local_id.is_empty() {
                record.local_id.clone_from(key);
            }
        }

        let store = Self {
            path,
            inner: RwLock::new(state),
        };
        store.with_read(|state| {
            info!(
                path = %store.path.display(),
                conversations = state
                    .backends
                    .get(&state.default_backend)
                    .map_or(0, |b| b.conversations.len()),
                "state loaded"
            );
            Ok(())
        })?;
        store.with_write(|_| Ok(()))?; // persist migrations and the URL
        Ok(store)
    }

    fn decode(raw: &str) -> Result<StateFile> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        if value.get("backends").is_none() && value.get("conversations").is_some() {
            debug!("migrating legacy state layout");
            let legacy: LegacyStateFile = serde_json::from_value(value)?;
            let mut backends = HashMap::new();
            backends.insert(
                DEFAULT_BACKEND.to_string(),
                BackendState {
                    url: String::new(),
                    conversations: legacy.conversations,
                },
            );
            return Ok(StateFile {
                backends,
                default_backend: DEFAULT_BACKEND.to_string(),
            });
        }
        Ok(serde_json::from_value(value)?)
    }

    fn with_read<T>(&self, f: impl FnOnce(&StateFile) -> Result<T>) -> Result<T> {
        let state = self
            .inner
            .read()
            .map_err(|_| FsError::Invariant("state lock poisoned".to_string()))?;
        f(&state)
    }

    /// Runs a mutation and persists the file before the lock is released.
    fn with_write<T>(&self, f: impl FnOnce(&mut StateFile) -> Result<T>) -> Result<T> {
        let mut state = self
            .inner
            .write()
            .map_err(|_| FsError::Invariant("state lock poisoned".to_string()))?;
        let out = f(&mut state)?;
        self.persist(&state)?;
        Ok(out)
    }

    fn persist(&self, state: &StateFile) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        let temp = self.path.with_extension("tmp");
        fs::write(&temp, &json)?;
        fs::set_permissions(&temp, fs::Permissions::from_mode(0o644))?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn records<'a>(state: &'a StateFile) -> &'a HashMap<String, ConversationRecord> {
        static EMPTY: std::sync::OnceLock<HashMap<String, ConversationRecord>> =
            std::sync::OnceLock::new();
        state
            .backends
            .get(&state.default_backend)
            .map_or_else(|| EMPTY.get_or_init(HashMap::new), |b| &b.conversations)
    }

    fn records_mut(state: &mut StateFile) -> &mut HashMap<String, ConversationRecord> {
        let name = state.default_backend.clone();
        &mut state.backends.entry(name).or_default().conversations
    }

    fn fresh_local_id(
        records: &HashMap<String, ConversationRecord>,
    ) -> Result<String> {
        for _ in 0..CLONE_ATTEMPTS {
            let candidate = Uuid::new_v4().simple().to_string()[..LOCAL_ID_LEN].to_string();
            if !records.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(FsError::Invariant(
            "exhausted local id generation attempts".to_string(),
        ))
    }

    /// Reserves a fresh local id with an uncreated record.
    #[instrument(skip(self))]
    pub fn clone_record(&self) -> Result<String> {
        self.with_write(|state| {
            let records = Self::records_mut(state);
            let local_id = Self::fresh_local_id(records)?;
            records.insert(
                local_id.clone(),
                ConversationRecord {
                    local_id: local_id.clone(),
                    ..ConversationRecord::default()
                },
            );
            debug!(local_id, "cloned conversation");
            Ok(local_id)
        })
    }

    /// A copy of the record for `local_id`.
    pub fn get(&self, local_id: &str) -> Option<ConversationRecord> {
        self.with_read(|state| Ok(Self::records(state).get(local_id).cloned()))
            .ok()
            .flatten()
    }

    /// Finds the record with the given backend id.
    pub fn get_by_backend_id(&self, backend_id: &str) -> Option<ConversationRecord> {
        if backend_id.is_empty() {
            return None;
        }
        self.with_read(|state| {
            Ok(Self::records(state)
                .values()
                .find(|r| r.backend_id == backend_id)
                .cloned())
        })
        .ok()
        .flatten()
    }

    /// Finds the record with the given slug. An empty slug never matches.
    pub fn get_by_slug(&self, slug: &str) -> Option<ConversationRecord> {
        if slug.is_empty() {
            return None;
        }
        self.with_read(|state| {
            Ok(Self::records(state)
                .values()
                .find(|r| r.slug == slug)
                .cloned())
        })
        .ok()
        .flatten()
    }

    /// Sets a pre-creation control key. `model` sets both the display name
    /// and the API id to the same value.
    pub fn set_ctl(&self, local_id: &str, key: &str, value: &str) -> Result<()> {
        match key {
            "model" => self.set_model(local_id, value, value),
            "cwd" => self.mutate_uncreated(local_id, |record| {
                record.cwd = value.to_string();
            }),
            other => Err(FsError::Invalid(format!("unknown ctl key: {other}"))),
        }
    }

    /// Sets the model, letting the display name and the API id differ.
    pub fn set_model(&self, local_id: &str, display_name: &str, api_id: &str) -> Result<()> {
        self.mutate_uncreated(local_id, |record| {
            record.model_display_name = display_name.to_string();
            record.model_api_id = api_id.to_string();
        })
    }

    fn mutate_uncreated(
        &self,
        local_id: &str,
        f: impl FnOnce(&mut ConversationRecord),
    ) -> Result<()> {
        self.with_write(|state| {
            let record = Self::records_mut(state)
                .get_mut(local_id)
                .ok_or(FsError::NotFound)?;
            if record.created {
                return Err(FsError::AlreadyCreated);
            }
            f(record);
            Ok(())
        })
    }

    /// Flips a record to created. Idempotent when called again with the same
    /// backend id.
    #[instrument(skip(self))]
    pub fn mark_created(&self, local_id: &str, backend_id: &str, slug: &str) -> Result<()> {
        self.with_write(|state| {
            let record = Self::records_mut(state)
                .get_mut(local_id)
                .ok_or(FsError::NotFound)?;
            if record.created {
                if record.backend_id == backend_id {
                    if record.slug.is_empty() && !slug.is_empty() {
                        record.slug = slug.to_string();
                    }
                    return Ok(());
                }
                return Err(FsError::Conflict(format!(
                    "conversation {local_id} already created as {}",
                    record.backend_id
                )));
            }
            record.created = true;
            record.backend_id = backend_id.to_string();
            record.slug = slug.to_string();
            Ok(())
        })
    }

    /// Accepts a backend conversation into local state.
    ///
    /// When a record with this backend id already exists, only its empty
    /// fields are filled in (`api_updated_at` moves forward only); otherwise
    /// a created record is inserted under a fresh local id. Returns the
    /// local id either way.
    #[instrument(skip(self, slug, api_created, api_updated, model, cwd))]
    pub fn adopt(
        &self,
        backend_id: &str,
        slug: &str,
        api_created: &str,
        api_updated: &str,
        model: &str,
        cwd: &str,
    ) -> Result<String> {
        if backend_id.is_empty() {
            return Err(FsError::Invalid("empty backend id".to_string()));
        }
        self.with_write(|state| {
            let records = Self::records_mut(state);
            if let Some(record) = records.values_mut().find(|r| r.backend_id == backend_id) {
                if record.slug.is_empty() && !slug.is_empty() {
                    record.slug = slug.to_string();
                }
                if record.api_created_at.is_empty() && !api_created.is_empty() {
                    record.api_created_at = api_created.to_string();
                }
                if !api_updated.is_empty() && api_updated > record.api_updated_at.as_str() {
                    record.api_updated_at = api_updated.to_string();
                }
                if record.model_display_name.is_empty() && !model.is_empty() {
                    record.model_display_name = model.to_string();
                    record.model_api_id = model.to_string();
                }
                if record.cwd.is_empty() && !cwd.is_empty() {
                    record.cwd = cwd.to_string();
                }
                return Ok(record.local_id.clone());
            }

            let local_id = Self::fresh_local_id(records)?;
            records.insert(
                local_id.clone(),
                ConversationRecord {
                    local_id: local_id.clone(),
                    backend_id: backend_id.to_string(),
                    slug: slug.to_string(),
                    model_display_name: model.to_string(),
                    model_api_id: model.to_string(),
                    cwd: cwd.to_string(),
                    created: true,
                    local_created_at: Utc::now(),
                    api_created_at: api_created.to_string(),
                    api_updated_at: api_updated.to_string(),
                },
            );
            debug!(local_id, backend_id, "adopted backend conversation");
            Ok(local_id)
        })
    }

    /// Sorted local ids of every live record.
    pub fn list(&self) -> Vec<String> {
        self.with_read(|state| {
            let mut ids: Vec<String> = Self::records(state).keys().cloned().collect();
            ids.sort();
            Ok(ids)
        })
        .unwrap_or_default()
    }

    /// Copies of every live record.
    pub fn list_mappings(&self) -> Vec<ConversationRecord> {
        self.with_read(|state| Ok(Self::records(state).values().cloned().collect()))
            .unwrap_or_default()
    }

    /// Deletes an uncreated record.
    pub fn delete(&self, local_id: &str) -> Result<()> {
        self.with_write(|state| {
            let records = Self::records_mut(state);
            let record = records.get(local_id).ok_or(FsError::NotFound)?;
            if record.created {
                return Err(FsError::NotPermitted);
            }
            records.remove(local_id);
            Ok(())
        })
    }

    /// Deletes a record unconditionally. For conversations the backend
    /// reports gone.
    pub fn force_delete(&self, local_id: &str) -> Result<()> {
        self.with_write(|state| {
            if Self::records_mut(state).remove(local_id).is_some() {
                info!(local_id, "force-deleted conversation record");
            }
            Ok(())
        })
    }

    /// Garbage-collects uncreated clones older than `timeout`. Returns the
    /// deleted local ids.
    pub fn gc_stale_clones(&self, timeout: Duration) -> Result<Vec<String>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout)
                .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        self.with_write(|state| {
            let records = Self::records_mut(state);
            let stale: Vec<String> = records
                .values()
                .filter(|r| !r.created && r.local_created_at < cutoff)
                .map(|r| r.local_id.clone())
                .collect();
            for local_id in &stale {
                records.remove(local_id);
                debug!(local_id, "garbage-collected stale clone");
            }
            Ok(stale)
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> StateStore {
        StateStore::open(dir.path(), "http://backend.test").unwrap()
    }

    #[test]
    fn clone_yields_distinct_eight_hex_ids() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let id = store.clone_record().unwrap();
            assert_eq!(id.len(), 8);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
            assert!(seen.insert(id.clone()));
            assert!(store.get(&id).is_some());
        }
    }

    #[test]
    fn uncreated_records_have_empty_backend_id() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.clone_record().unwrap();
        let record = store.get(&id).unwrap();
        assert!(!record.created);
        assert!(record.backend_id.is_empty());
    }

    #[test]
    fn state_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = open_store(&dir);
            let id = store.clone_record().unwrap();
            store.set_model(&id, "claude-opus-4.5", "claude-opus-4-5").unwrap();
            store.set_ctl(&id, "cwd", "/src/project").unwrap();
            store.mark_created(&id, "backend-1", "fix-stuff").unwrap();
            id
        };

        let store = open_store(&dir);
        let record = store.get(&id).unwrap();
        assert_eq!(record.local_id, id);
        assert_eq!(record.backend_id, "backend-1");
        assert_eq!(record.slug, "fix-stuff");
        assert_eq!(record.model_display_name, "claude-opus-4.5");
        assert_eq!(record.model_api_id, "claude-opus-4-5");
        assert_eq!(record.cwd, "/src/project");
        assert!(record.created);
    }

    #[test]
    fn ctl_rejects_unknown_keys_and_created_records() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.clone_record().unwrap();

        assert!(matches!(
            store.set_ctl(&id, "bogus", "x"),
            Err(FsError::Invalid(_))
        ));
        assert!(matches!(
            store.set_ctl("ffffffff", "model", "x"),
            Err(FsError::NotFound)
        ));

        store.mark_created(&id, "backend-1", "").unwrap();
        assert!(matches!(
            store.set_ctl(&id, "model", "other"),
            Err(FsError::AlreadyCreated)
        ));
    }

    #[test]
    fn mark_created_is_idempotent_and_never_reverts() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.clone_record().unwrap();

        store.mark_created(&id, "backend-1", "").unwrap();
        // Same backend id: fine, and a late slug backfills.
        store.mark_created(&id, "backend-1", "late-slug").unwrap();
        assert_eq!(store.get(&id).unwrap().slug, "late-slug");
        // Different backend id: conflict.
        assert!(matches!(
            store.mark_created(&id, "backend-2", ""),
            Err(FsError::Conflict(_))
        ));
        assert!(store.get(&id).unwrap().created);
    }

    #[test]
    fn adopt_is_idempotent_on_backend_id() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let first = store.adopt("backend-9", "", "", "", "", "").unwrap();
        let second = store.adopt("backend-9", "", "", "", "", "").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn adopt_fills_empty_fields_only() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let id = store
            .adopt("backend-9", "", "2026-01-01T00:00:00Z", "2026-01-01T00:00:00Z", "", "")
            .unwrap();

        // Empty slug backfills.
        store.adopt("backend-9", "first-slug", "", "", "", "").unwrap();
        assert_eq!(store.get(&id).unwrap().slug, "first-slug");

        // Non-empty slug is left alone.
        store.adopt("backend-9", "second-slug", "", "", "", "").unwrap();
        assert_eq!(store.get(&id).unwrap().slug, "first-slug");

        // updated_at only moves forward.
        store
            .adopt("backend-9", "", "", "2026-02-01T00:00:00Z", "", "")
            .unwrap();
        assert_eq!(
            store.get(&id).unwrap().api_updated_at,
            "2026-02-01T00:00:00Z"
        );
        store
            .adopt("backend-9", "", "", "2025-12-01T00:00:00Z", "", "")
            .unwrap();
        assert_eq!(
            store.get(&id).unwrap().api_updated_at,
            "2026-02-01T00:00:00Z"
        );
    }

    #[test]
    fn lookup_by_backend_id_and_slug() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.adopt("backend-9", "my-slug", "", "", "", "").unwrap();

        assert_eq!(store.get_by_backend_id("backend-9").unwrap().local_id, id);
        assert_eq!(store.get_by_slug("my-slug").unwrap().local_id, id);
        assert!(store.get_by_slug("").is_none());
        assert!(store.get_by_backend_id("").is_none());
    }

    #[test]
    fn delete_refuses_created_records() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let uncreated = store.clone_record().unwrap();
        store.delete(&uncreated).unwrap();
        assert!(store.get(&uncreated).is_none());

        let created = store.clone_record().unwrap();
        store.mark_created(&created, "backend-1", "").unwrap();
        assert!(matches!(store.delete(&created), Err(FsError::NotPermitted)));

        store.force_delete(&created).unwrap();
        assert!(store.get(&created).is_none());
    }

    #[test]
    fn gc_removes_only_stale_uncreated_clones() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let stale = store.clone_record().unwrap();
        let fresh = store.clone_record().unwrap();
        let created = store.clone_record().unwrap();
        store.mark_created(&created, "backend-1", "").unwrap();

        // Backdate two records well past any timeout.
        store
            .with_write(|state| {
                let records = StateStore::records_mut(state);
                for id in [&stale, &created] {
                    if let Some(r) = records.get_mut(id.as_str()) {
                        r.local_created_at = Utc::now() - chrono::Duration::days(30);
                    }
                }
                Ok(())
            })
            .unwrap();

        let removed = store.gc_stale_clones(Duration::from_secs(3600)).unwrap();
        assert_eq!(removed, vec![stale.clone()]);
        assert!(store.get(&stale).is_none());
        assert!(store.get(&fresh).is_some());
        assert!(store.get(&created).is_some());
    }

    #[test]
    fn state_layout_has_fixed_permissions() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.clone_record().unwrap();

        let dir_mode = fs::metadata(dir.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o755);
        let file_mode = fs::metadata(dir.path().join("state.json"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o644);
    }

    #[test]
    fn legacy_layout_migrates_under_main() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("state.json"),
            r#"{"conversations":{"deadbeef":{"backend_id":"backend-1","slug":"old-one","created":true}}}"#,
        )
        .unwrap();

        let store = open_store(&dir);
        let record = store.get("deadbeef").unwrap();
        assert_eq!(record.local_id, "deadbeef");
        assert_eq!(record.backend_id, "backend-1");
        assert!(record.created);

        // The rewritten file is in the current layout.
        let raw = fs::read_to_string(dir.path().join("state.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["default_backend"], "main");
        assert_eq!(
            value["backends"]["main"]["conversations"]["deadbeef"]["slug"],
            "old-one"
        );
        assert_eq!(value["backends"]["main"]["url"], "http://backend.test");
    }

    #[test]
    fn sorted_listing() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        for _ in 0..5 {
            store.clone_record().unwrap();
        }
        let ids = store.list();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(store.list_mappings().len(), 5);
    }
}

//! Durable identity map, per-project cursors and outstanding elevations.
//!
//! On disk the store is a JSON snapshot (`state.json`) plus an append-only
//! JSON-lines journal (`state.journal`). Every mutation is appended to the
//! journal and synced before the call returns, so a caller may only treat a
//! destination write as done once the matching `bind`/`touch`/`advance` has
//! returned. Opening the store replays the journal over the snapshot and
//! compacts both into a fresh snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

const SNAPSHOT_FILE: &str = "state.json";
const JOURNAL_FILE: &str = "state.journal";
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Issue,
    Comment,
    Worklog,
    Attachment,
    /// The custom-fields note of an issue.
    Metadata,
    Link,
    User,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Issue => "issue",
            EntityKind::Comment => "comment",
            EntityKind::Worklog => "worklog",
            EntityKind::Attachment => "attachment",
            EntityKind::Metadata => "metadata",
            EntityKind::Link => "link",
            EntityKind::User => "user",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityBinding {
    pub source_id: String,
    pub kind: EntityKind,
    pub destination_id: String,
    /// Source `updated_at` of the last complete sync. `None` while the
    /// entity's side effects are not all committed yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElevationRecord {
    pub user_id: u64,
    pub username: String,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    #[serde(default)]
    bindings: Vec<IdentityBinding>,
    #[serde(default)]
    cursors: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    elevations: Vec<ElevationRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    Bind {
        source_id: String,
        kind: EntityKind,
        destination_id: String,
    },
    Touch {
        source_id: String,
        kind: EntityKind,
        at: DateTime<Utc>,
    },
    Advance {
        project: String,
        at: DateTime<Utc>,
    },
    Elevate {
        record: ElevationRecord,
    },
    Revoke {
        user_id: u64,
    },
}

pub struct StateStore {
    dir: Option<PathBuf>,
    journal: Option<File>,
    /// Set when a failed append could not be undone. Further commits are
    /// refused until the next compaction rewrites the journal.
    poisoned: Option<String>,
    bindings: BTreeMap<(EntityKind, String), IdentityBinding>,
    cursors: BTreeMap<String, DateTime<Utc>>,
    elevations: BTreeMap<u64, ElevationRecord>,
}

/// Append one line and make it durable.
fn append(journal: &mut File, line: &[u8]) -> std::io::Result<()> {
    journal.write_all(line)?;
    journal.sync_data()
}

/// Drop whatever a failed append left after `len`.
fn truncate_to(journal: &mut File, len: u64) -> std::io::Result<()> {
    journal.set_len(len)?;
    journal.seek(SeekFrom::Start(len))?;
    journal.sync_data()
}

impl StateStore {
    /// Open (or create) the store kept in `dir`.
    pub fn open(dir: &Path) -> SyncResult<Self> {
        std::fs::create_dir_all(dir)?;
        let mut store = Self {
            dir: Some(dir.to_path_buf()),
            journal: None,
            poisoned: None,
            bindings: BTreeMap::new(),
            cursors: BTreeMap::new(),
            elevations: BTreeMap::new(),
        };

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        if snapshot_path.exists() {
            let contents = std::fs::read_to_string(&snapshot_path)?;
            let snapshot: Snapshot = serde_json::from_str(&contents)?;
            if snapshot.version != SNAPSHOT_VERSION {
                return Err(SyncError::StateStore(format!(
                    "unsupported state version {} in {}",
                    snapshot.version,
                    snapshot_path.display()
                )));
            }
            for binding in snapshot.bindings {
                store
                    .bindings
                    .insert((binding.kind, binding.source_id.clone()), binding);
            }
            store.cursors = snapshot.cursors;
            store.elevations = snapshot
                .elevations
                .into_iter()
                .map(|r| (r.user_id, r))
                .collect();
        } else {
            info!(path = %snapshot_path.display(), "no previous import state, starting fresh");
        }

        let journal_path = dir.join(JOURNAL_FILE);
        if journal_path.exists() {
            let replayed = store.replay(&journal_path)?;
            debug!(entries = replayed, "replayed state journal");
        }

        store.compact()?;
        Ok(store)
    }

    /// A store that lives only as long as the process. Used by tests and dry runs.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            journal: None,
            poisoned: None,
            bindings: BTreeMap::new(),
            cursors: BTreeMap::new(),
            elevations: BTreeMap::new(),
        }
    }

    fn replay(&mut self, path: &Path) -> SyncResult<usize> {
        let contents = std::fs::read_to_string(path)?;
        let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut applied = 0;
        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => {
                    self.apply(entry);
                    applied += 1;
                }
                // A crash in the middle of an append leaves a torn last line.
                Err(err) if index + 1 == lines.len() => {
                    warn!(error = %err, "ignoring torn last journal entry");
                }
                Err(err) => {
                    return Err(SyncError::StateStore(format!(
                        "corrupt journal entry {} in {}: {err}",
                        index + 1,
                        path.display()
                    )))
                }
            }
        }
        Ok(applied)
    }

    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Bind {
                source_id,
                kind,
                destination_id,
            } => {
                self.bindings.insert(
                    (kind, source_id.clone()),
                    IdentityBinding {
                        source_id,
                        kind,
                        destination_id,
                        last_seen: None,
                    },
                );
            }
            JournalEntry::Touch {
                source_id,
                kind,
                at,
            } => {
                if let Some(binding) = self.bindings.get_mut(&(kind, source_id)) {
                    binding.last_seen = Some(at);
                }
            }
            JournalEntry::Advance { project, at } => {
                self.cursors.insert(project, at);
            }
            JournalEntry::Elevate { record } => {
                self.elevations.insert(record.user_id, record);
            }
            JournalEntry::Revoke { user_id } => {
                self.elevations.remove(&user_id);
            }
        }
    }

    /// Write the journal entry durably, then apply it in memory.
    /// A failed append is cut off again so that later entries never follow a
    /// torn line.
    fn commit(&mut self, entry: JournalEntry) -> SyncResult<()> {
        if let Some(reason) = &self.poisoned {
            return Err(SyncError::StateStore(format!(
                "journal unusable after an earlier failure: {reason}"
            )));
        }
        if let Some(journal) = self.journal.as_mut() {
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            let start = journal.stream_position()?;
            if let Err(err) = append(journal, line.as_bytes()) {
                if let Err(undo) = truncate_to(journal, start) {
                    warn!(error = %undo, "cannot cut off failed journal append");
                    self.poisoned = Some(undo.to_string());
                }
                return Err(err.into());
            }
        }
        self.apply(entry);
        Ok(())
    }

    /// Fold the journal into a new snapshot and start an empty journal.
    pub fn compact(&mut self) -> SyncResult<()> {
        let Some(dir) = self.dir.clone() else {
            return Ok(());
        };
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            bindings: self.bindings.values().cloned().collect(),
            cursors: self.cursors.clone(),
            elevations: self.elevations.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;

        let tmp_path = dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(json.as_bytes())?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, dir.join(SNAPSHOT_FILE))?;

        let journal = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dir.join(JOURNAL_FILE))?;
        journal.sync_all()?;
        self.journal = Some(journal);
        self.poisoned = None;
        Ok(())
    }

    pub fn resolve(&self, source_id: &str, kind: EntityKind) -> Option<&str> {
        self.binding(source_id, kind)
            .map(|b| b.destination_id.as_str())
    }

    pub fn binding(&self, source_id: &str, kind: EntityKind) -> Option<&IdentityBinding> {
        self.bindings.get(&(kind, source_id.to_string()))
    }

    /// Record that `source_id` now lives at `destination_id`.
    pub fn bind(&mut self, source_id: &str, kind: EntityKind, destination_id: &str) -> SyncResult<()> {
        if let Some(existing) = self.binding(source_id, kind) {
            if existing.destination_id == destination_id {
                return Ok(());
            }
            return Err(SyncError::DuplicateBinding {
                kind,
                source_id: source_id.to_string(),
                existing: existing.destination_id.clone(),
                attempted: destination_id.to_string(),
            });
        }
        self.commit(JournalEntry::Bind {
            source_id: source_id.to_string(),
            kind,
            destination_id: destination_id.to_string(),
        })
    }

    /// Mark the bound entity as completely synced up to `at`.
    pub fn touch(&mut self, source_id: &str, kind: EntityKind, at: DateTime<Utc>) -> SyncResult<()> {
        match self.binding(source_id, kind) {
            None => Err(SyncError::StateStore(format!(
                "cannot record sync time of unbound {kind} {source_id}"
            ))),
            Some(binding) if binding.last_seen == Some(at) => Ok(()),
            Some(_) => self.commit(JournalEntry::Touch {
                source_id: source_id.to_string(),
                kind,
                at,
            }),
        }
    }

    pub fn cursor(&self, project: &str) -> Option<DateTime<Utc>> {
        self.cursors.get(project).copied()
    }

    /// Move the project cursor forward. Moving it back is a programming error.
    pub fn advance(&mut self, project: &str, at: DateTime<Utc>) -> SyncResult<()> {
        match self.cursor(project) {
            Some(current) if at < current => Err(SyncError::CursorRegression {
                project: project.to_string(),
                current,
                attempted: at,
            }),
            Some(current) if at == current => Ok(()),
            _ => self.commit(JournalEntry::Advance {
                project: project.to_string(),
                at,
            }),
        }
    }

    pub fn record_elevation(&mut self, record: ElevationRecord) -> SyncResult<()> {
        self.commit(JournalEntry::Elevate { record })
    }

    pub fn clear_elevation(&mut self, user_id: u64) -> SyncResult<()> {
        if !self.elevations.contains_key(&user_id) {
            return Ok(());
        }
        self.commit(JournalEntry::Revoke { user_id })
    }

    pub fn elevations(&self) -> Vec<ElevationRecord> {
        self.elevations.values().cloned().collect()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn bind_is_idempotent_for_same_destination() {
        let mut store = StateStore::in_memory();
        store.bind("PROJ-1", EntityKind::Issue, "g/p#1").unwrap();
        store.bind("PROJ-1", EntityKind::Issue, "g/p#1").unwrap();
        assert_eq!(store.resolve("PROJ-1", EntityKind::Issue), Some("g/p#1"));
        assert_eq!(store.resolve("PROJ-1", EntityKind::Comment), None);
        assert_eq!(store.binding_count(), 1);
    }

    #[test]
    fn conflicting_bind_is_rejected() {
        let mut store = StateStore::in_memory();
        store.bind("PROJ-1", EntityKind::Issue, "g/p#1").unwrap();
        let err = store.bind("PROJ-1", EntityKind::Issue, "g/p#2").unwrap_err();
        assert!(matches!(err, SyncError::DuplicateBinding { .. }));
        assert!(err.is_fatal());
        assert_eq!(store.resolve("PROJ-1", EntityKind::Issue), Some("g/p#1"));
    }

    #[test]
    fn cursor_only_moves_forward() {
        let mut store = StateStore::in_memory();
        store.advance("PROJ", ts(5)).unwrap();
        store.advance("PROJ", ts(5)).unwrap();
        store.advance("PROJ", ts(6)).unwrap();
        let err = store.advance("PROJ", ts(4)).unwrap_err();
        assert!(matches!(err, SyncError::CursorRegression { .. }));
        assert_eq!(store.cursor("PROJ"), Some(ts(6)));
        assert_eq!(store.cursor("OTHER"), None);
    }

    #[test]
    fn touch_requires_binding() {
        let mut store = StateStore::in_memory();
        assert!(store.touch("PROJ-1", EntityKind::Issue, ts(1)).is_err());
        store.bind("PROJ-1", EntityKind::Issue, "g/p#1").unwrap();
        store.touch("PROJ-1", EntityKind::Issue, ts(1)).unwrap();
        assert_eq!(
            store.binding("PROJ-1", EntityKind::Issue).unwrap().last_seen,
            Some(ts(1))
        );
    }

    #[test]
    fn state_survives_reopen_without_compaction() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = StateStore::open(dir.path()).unwrap();
            store.bind("PROJ-1", EntityKind::Issue, "g/p#1").unwrap();
            store.touch("PROJ-1", EntityKind::Issue, ts(3)).unwrap();
            store.advance("PROJ", ts(3)).unwrap();
            store
                .record_elevation(ElevationRecord {
                    user_id: 9,
                    username: "bob".into(),
                    granted_at: ts(2),
                })
                .unwrap();
            // dropped without compaction: only the journal holds the changes
        }
        let journal = std::fs::read_to_string(dir.path().join(JOURNAL_FILE)).unwrap();
        assert_eq!(journal.lines().count(), 4);

        let store = StateStore::open(dir.path()).unwrap();
        assert_eq!(store.resolve("PROJ-1", EntityKind::Issue), Some("g/p#1"));
        assert_eq!(store.cursor("PROJ"), Some(ts(3)));
        assert_eq!(store.elevations().len(), 1);
        // reopening compacted the journal into the snapshot
        let journal = std::fs::read_to_string(dir.path().join(JOURNAL_FILE)).unwrap();
        assert!(journal.is_empty());
    }

    #[test]
    fn torn_last_journal_line_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = StateStore::open(dir.path()).unwrap();
            store.bind("PROJ-1", EntityKind::Issue, "g/p#1").unwrap();
        }
        let mut journal = OpenOptions::new()
            .append(true)
            .open(dir.path().join(JOURNAL_FILE))
            .unwrap();
        journal.write_all(b"{\"op\":\"bind\",\"source_id\":\"PRO").unwrap();
        drop(journal);

        let store = StateStore::open(dir.path()).unwrap();
        assert_eq!(store.binding_count(), 1);
    }

    #[test]
    fn failed_append_is_cut_off_before_the_next_entry() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = StateStore::open(dir.path()).unwrap();
            store.bind("PROJ-1", EntityKind::Issue, "g/p#1").unwrap();

            // an append that died halfway through its line
            let journal = store.journal.as_mut().unwrap();
            let start = journal.stream_position().unwrap();
            journal.write_all(b"{\"op\":\"bind\",\"source_id\":\"PRO").unwrap();
            truncate_to(journal, start).unwrap();

            store.bind("PROJ-2", EntityKind::Issue, "g/p#2").unwrap();
            store.advance("PROJ", ts(2)).unwrap();
        }
        let journal = std::fs::read_to_string(dir.path().join(JOURNAL_FILE)).unwrap();
        assert_eq!(journal.lines().count(), 3);
        assert!(!journal.contains('\0'));

        let store = StateStore::open(dir.path()).unwrap();
        assert_eq!(store.resolve("PROJ-2", EntityKind::Issue), Some("g/p#2"));
        assert_eq!(store.cursor("PROJ"), Some(ts(2)));
    }

    #[test]
    fn poisoned_store_refuses_commits_until_compacted() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(dir.path()).unwrap();
        store.poisoned = Some("disk full".into());

        let err = store.bind("PROJ-1", EntityKind::Issue, "g/p#1").unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("disk full"));
        assert_eq!(store.resolve("PROJ-1", EntityKind::Issue), None);

        store.compact().unwrap();
        store.bind("PROJ-1", EntityKind::Issue, "g/p#1").unwrap();
        drop(store);
        let store = StateStore::open(dir.path()).unwrap();
        assert_eq!(store.resolve("PROJ-1", EntityKind::Issue), Some("g/p#1"));
    }

    #[test]
    fn corrupt_journal_in_the_middle_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(JOURNAL_FILE),
            "not json\n{\"op\":\"advance\",\"project\":\"P\",\"at\":\"2024-01-01T00:00:00Z\"}\n",
        )
        .unwrap();
        assert!(matches!(
            StateStore::open(dir.path()),
            Err(SyncError::StateStore(_))
        ));
    }

    #[test]
    fn revoked_elevations_are_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = StateStore::open(dir.path()).unwrap();
            store
                .record_elevation(ElevationRecord {
                    user_id: 1,
                    username: "alice".into(),
                    granted_at: ts(1),
                })
                .unwrap();
            store.clear_elevation(1).unwrap();
            store.clear_elevation(42).unwrap();
        }
        let store = StateStore::open(dir.path()).unwrap();
        assert!(store.elevations().is_empty());
    }
}

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;

use anyhow::{Context, anyhow};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::profile::{Settings, UserProfile};
use crate::task::Task;
use crate::undo::Tombstone;

/// Persistence boundary for the task collection and the few records that
/// live next to it.
///
/// Implementations report failures honestly; the provided `*_or_empty` and
/// `*_best_effort` methods are what the engine calls, and they never let a
/// storage fault reach the caller.
pub trait TaskStore: Send + Sync {
    fn load_tasks(&self) -> anyhow::Result<Vec<Task>>;
    fn save_tasks(&self, tasks: &[Task]) -> anyhow::Result<()>;

    fn load_tombstone(&self) -> anyhow::Result<Option<Tombstone>>;
    fn save_tombstone(&self, tombstone: Option<&Tombstone>) -> anyhow::Result<()>;

    fn load_profile(&self) -> anyhow::Result<Option<UserProfile>>;
    fn save_profile(&self, profile: &UserProfile) -> anyhow::Result<()>;

    fn load_settings(&self) -> anyhow::Result<Settings>;
    fn save_settings(&self, settings: &Settings) -> anyhow::Result<()>;

    fn load_tasks_or_empty(&self) -> Vec<Task> {
        match self.load_tasks() {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "task data unreadable; starting empty");
                Vec::new()
            }
        }
    }

    fn save_tasks_best_effort(&self, tasks: &[Task]) {
        if let Err(err) = self.save_tasks(tasks) {
            warn!(error = %format!("{err:#}"), count = tasks.len(), "failed to persist tasks");
        }
    }

    fn save_tombstone_best_effort(&self, tombstone: Option<&Tombstone>) {
        if let Err(err) = self.save_tombstone(tombstone) {
            warn!(error = %format!("{err:#}"), "failed to persist pending deletion");
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataStore {
    pub data_dir: PathBuf,
    pub tasks_path: PathBuf,
    pub tombstone_path: PathBuf,
    pub profile_path: PathBuf,
    pub settings_path: PathBuf,
}

impl DataStore {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let data_dir = data_dir.to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let store = Self {
            tasks_path: data_dir.join("tasks.data"),
            tombstone_path: data_dir.join("tombstone.data"),
            profile_path: data_dir.join("profile.toml"),
            settings_path: data_dir.join("settings.toml"),
            data_dir,
        };

        info!(
            data_dir = %store.data_dir.display(),
            tasks = %store.tasks_path.display(),
            "opened datastore"
        );
        Ok(store)
    }
}

impl TaskStore for DataStore {
    #[tracing::instrument(skip(self))]
    fn load_tasks(&self) -> anyhow::Result<Vec<Task>> {
        load_jsonl(&self.tasks_path).context("failed to load tasks.data")
    }

    #[tracing::instrument(skip(self, tasks))]
    fn save_tasks(&self, tasks: &[Task]) -> anyhow::Result<()> {
        save_jsonl_atomic(&self.tasks_path, tasks).context("failed to save tasks.data")
    }

    #[tracing::instrument(skip(self))]
    fn load_tombstone(&self) -> anyhow::Result<Option<Tombstone>> {
        let mut entries: Vec<Tombstone> =
            load_jsonl(&self.tombstone_path).context("failed to load tombstone.data")?;
        Ok(entries.pop())
    }

    #[tracing::instrument(skip(self, tombstone))]
    fn save_tombstone(&self, tombstone: Option<&Tombstone>) -> anyhow::Result<()> {
        let entries: Vec<&Tombstone> = tombstone.into_iter().collect();
        save_jsonl_atomic(&self.tombstone_path, &entries).context("failed to save tombstone.data")
    }

    #[tracing::instrument(skip(self))]
    fn load_profile(&self) -> anyhow::Result<Option<UserProfile>> {
        load_toml(&self.profile_path)
    }

    #[tracing::instrument(skip(self, profile))]
    fn save_profile(&self, profile: &UserProfile) -> anyhow::Result<()> {
        save_toml_atomic(&self.profile_path, profile)
    }

    #[tracing::instrument(skip(self))]
    fn load_settings(&self) -> anyhow::Result<Settings> {
        Ok(load_toml(&self.settings_path)?.unwrap_or_default())
    }

    #[tracing::instrument(skip(self, settings))]
    fn save_settings(&self, settings: &Settings) -> anyhow::Result<()> {
        save_toml_atomic(&self.settings_path, settings)
    }
}

/// In-process store. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tasks: Vec<Task>,
    tombstone: Option<Tombstone>,
    profile: Option<UserProfile>,
    settings: Settings,
    fail_writes: bool,
    saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        let store = Self::new();
        store.inner.lock().tasks = tasks;
        store
    }

    /// Makes every subsequent write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    /// Number of successful task-collection saves so far.
    pub fn save_count(&self) -> usize {
        self.inner.lock().saves
    }

    fn check_writable(&self) -> anyhow::Result<()> {
        if self.inner.lock().fail_writes {
            return Err(anyhow!("memory store is read-only"));
        }
        Ok(())
    }
}

impl TaskStore for MemoryStore {
    fn load_tasks(&self) -> anyhow::Result<Vec<Task>> {
        Ok(self.inner.lock().tasks.clone())
    }

    fn save_tasks(&self, tasks: &[Task]) -> anyhow::Result<()> {
        self.check_writable()?;
        let mut state = self.inner.lock();
        state.tasks = tasks.to_vec();
        state.saves += 1;
        Ok(())
    }

    fn load_tombstone(&self) -> anyhow::Result<Option<Tombstone>> {
        Ok(self.inner.lock().tombstone.clone())
    }

    fn save_tombstone(&self, tombstone: Option<&Tombstone>) -> anyhow::Result<()> {
        self.check_writable()?;
        self.inner.lock().tombstone = tombstone.cloned();
        Ok(())
    }

    fn load_profile(&self) -> anyhow::Result<Option<UserProfile>> {
        Ok(self.inner.lock().profile.clone())
    }

    fn save_profile(&self, profile: &UserProfile) -> anyhow::Result<()> {
        self.check_writable()?;
        self.inner.lock().profile = Some(profile.clone());
        Ok(())
    }

    fn load_settings(&self) -> anyhow::Result<Settings> {
        Ok(self.inner.lock().settings.clone())
    }

    fn save_settings(&self, settings: &Settings) -> anyhow::Result<()> {
        self.check_writable()?;
        self.inner.lock().settings = settings.clone();
        Ok(())
    }
}

enum WriteRequest {
    Tasks(Vec<Task>),
    Flush(mpsc::Sender<()>),
}

/// Moves task-collection writes onto a single background writer.
///
/// Snapshots are written in order; when several are queued only the newest
/// one reaches the inner store. Everything else is delegated synchronously.
pub struct WriteBehind<S: TaskStore + 'static> {
    inner: Arc<S>,
    tx: Option<mpsc::Sender<WriteRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl<S: TaskStore + 'static> WriteBehind<S> {
    pub fn new(inner: S) -> Self {
        let inner = Arc::new(inner);
        let (tx, rx) = mpsc::channel::<WriteRequest>();
        let writer = Arc::clone(&inner);

        let worker = std::thread::spawn(move || {
            while let Ok(first) = rx.recv() {
                let mut latest: Option<Vec<Task>> = None;
                let mut waiters = Vec::new();
                let mut next = Some(first);

                while let Some(request) = next {
                    match request {
                        WriteRequest::Tasks(tasks) => latest = Some(tasks),
                        WriteRequest::Flush(ack) => waiters.push(ack),
                    }
                    next = rx.try_recv().ok();
                }

                if let Some(tasks) = latest {
                    debug!(count = tasks.len(), "write-behind flushing snapshot");
                    writer.save_tasks_best_effort(&tasks);
                }
                for ack in waiters {
                    let _ = ack.send(());
                }
            }
            debug!("write-behind worker exiting");
        });

        Self {
            inner,
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Blocks until every snapshot queued so far has been written.
    pub fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (ack_tx, ack_rx) = mpsc::channel();
        if tx.send(WriteRequest::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

impl<S: TaskStore + 'static> TaskStore for WriteBehind<S> {
    fn load_tasks(&self) -> anyhow::Result<Vec<Task>> {
        self.flush();
        self.inner.load_tasks()
    }

    fn save_tasks(&self, tasks: &[Task]) -> anyhow::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow!("write-behind writer already stopped"))?;
        tx.send(WriteRequest::Tasks(tasks.to_vec()))
            .map_err(|_| anyhow!("write-behind writer is gone"))
    }

    fn load_tombstone(&self) -> anyhow::Result<Option<Tombstone>> {
        self.inner.load_tombstone()
    }

    fn save_tombstone(&self, tombstone: Option<&Tombstone>) -> anyhow::Result<()> {
        self.inner.save_tombstone(tombstone)
    }

    fn load_profile(&self) -> anyhow::Result<Option<UserProfile>> {
        self.inner.load_profile()
    }

    fn save_profile(&self, profile: &UserProfile) -> anyhow::Result<()> {
        self.inner.save_profile(profile)
    }

    fn load_settings(&self) -> anyhow::Result<Settings> {
        self.inner.load_settings()
    }

    fn save_settings(&self, settings: &Settings) -> anyhow::Result<()> {
        self.inner.save_settings(settings)
    }
}

impl<S: TaskStore + 'static> Drop for WriteBehind<S> {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("write-behind worker panicked");
        }
    }
}

#[tracing::instrument(skip(path))]
pub(crate) fn load_jsonl<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    debug!(file = %path.display(), "loading jsonl");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let record: T = serde_json::from_str(trimmed)
            .with_context(|| format!("failed parsing {} line {}", path.display(), idx + 1))?;
        out.push(record);
    }

    debug!(count = out.len(), "loaded records from jsonl");
    Ok(out)
}

#[tracing::instrument(skip(path, records))]
pub(crate) fn save_jsonl_atomic<T: Serialize>(path: &Path, records: &[T]) -> anyhow::Result<()> {
    debug!(file = %path.display(), count = records.len(), "saving jsonl atomically");

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    for record in records {
        let serialized = serde_json::to_string(record)?;
        writeln!(temp, "{serialized}")?;
    }
    temp.flush()?;

    temp.persist(path)
        .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;

    Ok(())
}

fn load_toml<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading {}", path.display()))?;
    let parsed =
        toml::from_str(&raw).with_context(|| format!("failed parsing {}", path.display()))?;
    Ok(Some(parsed))
}

fn save_toml_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let body = toml::to_string(value)
        .with_context(|| format!("failed serializing {}", path.display()))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(body.as_bytes())?;
    temp.flush()?;
    temp.persist(path)
        .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::tempdir;

    use super::*;
    use crate::task::{Attachment, Category, Priority};

    fn sample_tasks() -> Vec<Task> {
        let now = Utc.with_ymd_and_hms(2026, 4, 2, 8, 30, 0).unwrap();
        let mut first = Task::new("buy milk", now);
        first.category = Some(Category::Shopping);
        first.due = Some(now + Duration::hours(3));
        first.push_attachment(Attachment::from_bytes("image/jpeg", b"\xff\xd8"));

        let mut second = Task::new("finish essay", now - Duration::days(1));
        second.priority = Priority::High;
        second.notes = Some("chapter 3".to_string());
        second.mark_completed(now);

        vec![first, second]
    }

    #[test]
    fn missing_files_read_as_first_run() {
        let temp = tempdir().expect("tempdir");
        let store = DataStore::open(temp.path()).expect("open");

        assert!(store.load_tasks().expect("load").is_empty());
        assert!(store.load_tombstone().expect("tombstone").is_none());
        assert!(store.load_profile().expect("profile").is_none());
        assert_eq!(store.load_settings().expect("settings"), Settings::default());
    }

    #[test]
    fn saving_twice_is_idempotent() {
        let temp = tempdir().expect("tempdir");
        let store = DataStore::open(temp.path()).expect("open");
        let tasks = sample_tasks();

        store.save_tasks(&tasks).expect("save once");
        let first = fs::read_to_string(&store.tasks_path).expect("read");
        store.save_tasks(&tasks).expect("save twice");
        let second = fs::read_to_string(&store.tasks_path).expect("read");

        assert_eq!(first, second);
        assert_eq!(store.load_tasks().expect("load"), tasks);
    }

    #[test]
    fn corrupt_task_file_loads_as_empty() {
        let temp = tempdir().expect("tempdir");
        let store = DataStore::open(temp.path()).expect("open");
        fs::write(&store.tasks_path, "{not json\n").expect("write garbage");

        assert!(store.load_tasks().is_err());
        assert!(store.load_tasks_or_empty().is_empty());
    }

    #[test]
    fn profile_and_settings_round_trip() {
        let temp = tempdir().expect("tempdir");
        let store = DataStore::open(temp.path()).expect("open");
        let now = Utc.with_ymd_and_hms(2026, 4, 2, 8, 30, 0).unwrap();

        let profile = UserProfile::new("Ana", now);
        store.save_profile(&profile).expect("save profile");
        assert_eq!(store.load_profile().expect("load"), Some(profile));

        let settings = Settings {
            dark_mode: Some(true),
        };
        store.save_settings(&settings).expect("save settings");
        assert_eq!(store.load_settings().expect("load"), settings);
    }

    #[test]
    fn tombstone_is_cleared_by_saving_none() {
        let temp = tempdir().expect("tempdir");
        let store = DataStore::open(temp.path()).expect("open");
        let task = sample_tasks().remove(0);
        let tombstone = Tombstone {
            deadline: task.created_at + Duration::seconds(8),
            task,
        };

        store.save_tombstone(Some(&tombstone)).expect("save");
        assert_eq!(store.load_tombstone().expect("load"), Some(tombstone));

        store.save_tombstone(None).expect("clear");
        assert_eq!(store.load_tombstone().expect("load"), None);
    }

    #[test]
    fn write_behind_delivers_latest_snapshot() {
        let memory = MemoryStore::new();
        let store = WriteBehind::new(memory.clone());
        let tasks = sample_tasks();

        store.save_tasks(&tasks[..1]).expect("queue first");
        store.save_tasks(&tasks).expect("queue second");
        store.flush();

        assert_eq!(memory.load_tasks().expect("load"), tasks);
        assert_eq!(store.load_tasks().expect("load through wrapper"), tasks);
    }

    #[test]
    fn write_behind_drains_on_drop() {
        let memory = MemoryStore::new();
        {
            let store = WriteBehind::new(memory.clone());
            store.save_tasks(&sample_tasks()).expect("queue");
        }
        assert_eq!(memory.load_tasks().expect("load").len(), 2);
    }

    #[test]
    fn failed_write_is_swallowed_by_best_effort_save() {
        let memory = MemoryStore::new();
        memory.fail_writes(true);
        memory.save_tasks_best_effort(&sample_tasks());
        assert!(memory.load_tasks().expect("load").is_empty());
        assert_eq!(memory.save_count(), 0);
    }
}

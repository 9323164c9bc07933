use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::datastore::{load_jsonl, save_jsonl_atomic};
use crate::datetime::stamp_serde;
use crate::task::Task;

/// A pending local reminder. Keyed by the id of the task it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reminder {
    pub task_id: Uuid,
    #[serde(with = "stamp_serde")]
    pub fire_at: DateTime<Utc>,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
}

impl Reminder {
    pub fn for_task(task: &Task) -> Option<Self> {
        let fire_at = task.due?;
        Some(Self {
            task_id: task.id,
            fire_at,
            title: task.title.clone(),
            body: task.notes.clone(),
        })
    }
}

/// The host's local-notification facility.
pub trait NotificationHost: Send {
    fn request_permission(&mut self) -> anyhow::Result<bool>;
    fn schedule(&mut self, reminder: &Reminder) -> anyhow::Result<()>;
    fn cancel(&mut self, task_id: Uuid) -> anyhow::Result<()>;
    /// Ids of every reminder the host still holds, including ones scheduled
    /// by an earlier process.
    fn pending(&self) -> anyhow::Result<Vec<Uuid>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Unknown,
    Granted,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoDueDate,
    DueInPast,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled,
    /// The host already holds an identical reminder.
    Unchanged,
    Skipped(SkipReason),
    /// Permission was denied.
    Suppressed,
    Cancelled,
    Failed,
}

/// Keeps the host's reminders in line with task state.
///
/// Every host error is logged and folded into a `ScheduleOutcome`; nothing
/// here returns an error to the caller.
pub struct ReminderScheduler {
    host: Box<dyn NotificationHost>,
    permission: Permission,
    known: BTreeMap<Uuid, Reminder>,
}

impl ReminderScheduler {
    pub fn new(host: Box<dyn NotificationHost>) -> Self {
        Self {
            host,
            permission: Permission::Unknown,
            known: BTreeMap::new(),
        }
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    /// Asks the host once; later calls return the cached answer.
    #[instrument(skip(self))]
    pub fn request_permission(&mut self) -> bool {
        if self.permission == Permission::Unknown {
            self.permission = match self.host.request_permission() {
                Ok(true) => Permission::Granted,
                Ok(false) => Permission::Denied,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "permission request failed; treating as denied");
                    Permission::Denied
                }
            };
            info!(permission = ?self.permission, "notification permission resolved");
        }
        self.permission == Permission::Granted
    }

    pub fn reminder_for(&self, task_id: Uuid) -> Option<&Reminder> {
        self.known.get(&task_id)
    }

    pub fn reminders(&self) -> impl Iterator<Item = &Reminder> {
        self.known.values()
    }

    #[instrument(skip(self, task, now), fields(task = %task.id))]
    pub fn schedule_for_task(&mut self, task: &Task, now: DateTime<Utc>) -> ScheduleOutcome {
        let Some(due) = task.due else {
            return ScheduleOutcome::Skipped(SkipReason::NoDueDate);
        };
        if task.completed {
            return ScheduleOutcome::Skipped(SkipReason::Completed);
        }
        if due <= now {
            return ScheduleOutcome::Skipped(SkipReason::DueInPast);
        }
        if !self.request_permission() {
            debug!("notifications denied; not scheduling");
            return ScheduleOutcome::Suppressed;
        }
        let Some(reminder) = Reminder::for_task(task) else {
            return ScheduleOutcome::Skipped(SkipReason::NoDueDate);
        };

        // The host replaces by id, but cancel first so a failed schedule
        // never leaves the old fire time behind.
        if self.known.remove(&task.id).is_some()
            && let Err(err) = self.host.cancel(task.id)
        {
            warn!(error = %format!("{err:#}"), "failed to cancel previous reminder");
        }

        match self.host.schedule(&reminder) {
            Ok(()) => {
                debug!(fire_at = %reminder.fire_at, "reminder scheduled");
                self.known.insert(task.id, reminder);
                ScheduleOutcome::Scheduled
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to schedule reminder");
                ScheduleOutcome::Failed
            }
        }
    }

    #[instrument(skip(self))]
    pub fn cancel_for_task(&mut self, task_id: Uuid) -> ScheduleOutcome {
        let was_known = self.known.remove(&task_id).is_some();
        if let Err(err) = self.host.cancel(task_id) {
            warn!(error = %format!("{err:#}"), "failed to cancel reminder");
            return ScheduleOutcome::Failed;
        }
        if was_known {
            ScheduleOutcome::Cancelled
        } else {
            ScheduleOutcome::Unchanged
        }
    }

    /// Schedules or cancels so the host matches what `task` calls for.
    pub fn reconcile(&mut self, task: &Task, now: DateTime<Utc>) -> ScheduleOutcome {
        if !task.wants_reminder(now) {
            return self.cancel_for_task(task.id);
        }
        if let Some(desired) = Reminder::for_task(task)
            && self.known.get(&task.id) == Some(&desired)
        {
            return ScheduleOutcome::Unchanged;
        }
        self.schedule_for_task(task, now)
    }

    /// Drops every reminder this process or an earlier one left behind and
    /// rebuilds the set from `tasks`. Returns how many were scheduled.
    #[instrument(skip(self, tasks, now), fields(count = tasks.len()))]
    pub fn reschedule_all(&mut self, tasks: &[Task], now: DateTime<Utc>) -> usize {
        let mut stale: Vec<Uuid> = self.known.keys().copied().collect();
        match self.host.pending() {
            Ok(ids) => stale.extend(ids),
            Err(err) => warn!(error = %format!("{err:#}"), "failed to list host reminders"),
        }
        stale.sort();
        stale.dedup();

        for id in stale {
            if let Err(err) = self.host.cancel(id) {
                warn!(task = %id, error = %format!("{err:#}"), "failed to cancel stale reminder");
            }
        }
        self.known.clear();

        let scheduled = tasks
            .iter()
            .filter(|task| self.schedule_for_task(task, now) == ScheduleOutcome::Scheduled)
            .count();
        info!(scheduled, "reminders rebuilt");
        scheduled
    }
}

#[derive(Debug, Default)]
struct MemoryHostState {
    grant: bool,
    permission_requests: usize,
    fail_schedule: bool,
    reminders: BTreeMap<Uuid, Reminder>,
}

/// In-process host. Clones share state, so a test can keep one handle and
/// give the other to a scheduler.
#[derive(Debug, Clone)]
pub struct MemoryHost {
    state: Arc<Mutex<MemoryHostState>>,
}

impl MemoryHost {
    pub fn granting() -> Self {
        Self::with_grant(true)
    }

    pub fn denying() -> Self {
        Self::with_grant(false)
    }

    fn with_grant(grant: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryHostState {
                grant,
                ..MemoryHostState::default()
            })),
        }
    }

    pub fn fail_schedule(&self, fail: bool) {
        self.state.lock().fail_schedule = fail;
    }

    pub fn permission_requests(&self) -> usize {
        self.state.lock().permission_requests
    }

    pub fn get(&self, task_id: Uuid) -> Option<Reminder> {
        self.state.lock().reminders.get(&task_id).cloned()
    }

    pub fn reminders(&self) -> Vec<Reminder> {
        self.state.lock().reminders.values().cloned().collect()
    }

    /// Plants a reminder as if an earlier run had scheduled it.
    pub fn preload(&self, reminder: Reminder) {
        self.state
            .lock()
            .reminders
            .insert(reminder.task_id, reminder);
    }
}

impl NotificationHost for MemoryHost {
    fn request_permission(&mut self) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        state.permission_requests += 1;
        Ok(state.grant)
    }

    fn schedule(&mut self, reminder: &Reminder) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.fail_schedule {
            return Err(anyhow!("host refused to schedule"));
        }
        state.reminders.insert(reminder.task_id, reminder.clone());
        Ok(())
    }

    fn cancel(&mut self, task_id: Uuid) -> anyhow::Result<()> {
        self.state.lock().reminders.remove(&task_id);
        Ok(())
    }

    fn pending(&self) -> anyhow::Result<Vec<Uuid>> {
        Ok(self.state.lock().reminders.keys().copied().collect())
    }
}

/// File-backed host: reminders are spooled as JSON lines for an external
/// delivery agent to pick up.
#[derive(Debug, Clone)]
pub struct SpoolHost {
    path: PathBuf,
    enabled: bool,
}

impl SpoolHost {
    pub fn new(data_dir: &Path, enabled: bool) -> Self {
        let path = data_dir.join("reminders.data");
        debug!(path = %path.display(), enabled, "initialized reminder spool");
        Self { path, enabled }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> anyhow::Result<Vec<Reminder>> {
        load_jsonl(&self.path).context("failed to load reminders.data")
    }

    fn store(&self, reminders: &[Reminder]) -> anyhow::Result<()> {
        save_jsonl_atomic(&self.path, reminders).context("failed to save reminders.data")
    }
}

impl NotificationHost for SpoolHost {
    fn request_permission(&mut self) -> anyhow::Result<bool> {
        Ok(self.enabled)
    }

    fn schedule(&mut self, reminder: &Reminder) -> anyhow::Result<()> {
        let mut reminders = self.load()?;
        reminders.retain(|existing| existing.task_id != reminder.task_id);
        reminders.push(reminder.clone());
        reminders.sort_by_key(|r| r.fire_at);
        self.store(&reminders)
    }

    fn cancel(&mut self, task_id: Uuid) -> anyhow::Result<()> {
        let mut reminders = self.load()?;
        let before = reminders.len();
        reminders.retain(|existing| existing.task_id != task_id);
        if reminders.len() != before {
            self.store(&reminders)?;
        }
        Ok(())
    }

    fn pending(&self) -> anyhow::Result<Vec<Uuid>> {
        Ok(self.load()?.into_iter().map(|r| r.task_id).collect())
    }
}

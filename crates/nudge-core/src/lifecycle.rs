use std::collections::HashSet;
use std::sync::{Arc, mpsc};

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::datastore::TaskStore;
use crate::datetime::Calendar;
use crate::events::{ChangeFeed, TasksSnapshot};
use crate::notify::{NotificationHost, ReminderScheduler};
use crate::task::Task;
use crate::undo::{DEFAULT_UNDO_WINDOW_SECS, DelayedSlot, Tombstone};
use crate::view::{self, Stats, ViewFilter};

#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    pub undo_window: Duration,
    pub calendar: Calendar,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            undo_window: Duration::seconds(DEFAULT_UNDO_WINDOW_SECS),
            calendar: Calendar::utc(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Created,
    Updated,
}

/// Owner of the canonical task collection.
///
/// Every mutation goes through `&mut self`. Persistence and reminder work
/// happen as side effects of each transition and are best-effort: their
/// failures are logged, never returned. The only errors these methods
/// return are caller mistakes such as an unknown id.
pub struct TaskManager {
    tasks: Vec<Task>,
    store: Box<dyn TaskStore>,
    scheduler: ReminderScheduler,
    clock: Arc<dyn Clock>,
    options: ManagerOptions,
    pending_confirm: Option<Uuid>,
    pending_delete: DelayedSlot<Task>,
    feed: ChangeFeed,
}

impl TaskManager {
    /// Loads the collection, restores an unexpired pending deletion, and
    /// rebuilds reminders from scratch.
    #[instrument(skip_all)]
    pub fn open(
        store: Box<dyn TaskStore>,
        host: Box<dyn NotificationHost>,
        clock: Arc<dyn Clock>,
        options: ManagerOptions,
    ) -> Self {
        let now = clock.now();
        let tasks = dedupe_by_id(store.load_tasks_or_empty());

        let mut pending_delete = DelayedSlot::new();
        match store.load_tombstone() {
            Ok(Some(tombstone))
                if !tombstone.is_expired(now)
                    && !tasks.iter().any(|task| task.id == tombstone.task.id) =>
            {
                debug!(task = %tombstone.task.id, deadline = %tombstone.deadline, "restored pending deletion");
                pending_delete.arm(tombstone.task, tombstone.deadline);
            }
            Ok(Some(tombstone)) => {
                debug!(task = %tombstone.task.id, "discarding stale pending deletion");
                store.save_tombstone_best_effort(None);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %format!("{err:#}"), "pending deletion unreadable; ignoring");
            }
        }

        let mut scheduler = ReminderScheduler::new(host);
        scheduler.request_permission();
        scheduler.reschedule_all(&tasks, now);

        info!(
            count = tasks.len(),
            pending_delete = pending_delete.is_armed(),
            "task manager ready"
        );

        Self {
            tasks,
            store,
            scheduler,
            clock,
            options,
            pending_confirm: None,
            pending_delete,
            feed: ChangeFeed::new(),
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn snapshot(&self) -> TasksSnapshot {
        self.tasks.clone().into()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn calendar(&self) -> &Calendar {
        &self.options.calendar
    }

    pub fn scheduler(&self) -> &ReminderScheduler {
        &self.scheduler
    }

    pub fn subscribe(&mut self) -> mpsc::Receiver<TasksSnapshot> {
        self.feed.subscribe()
    }

    pub fn view(&self, filter: ViewFilter) -> Vec<Task> {
        view::project(&self.tasks, filter, self.now(), &self.options.calendar)
    }

    pub fn stats(&self) -> Stats {
        view::stats(&self.tasks, self.now(), &self.options.calendar)
    }

    /// The task waiting out its undo window, with its deadline.
    pub fn pending_deletion(&self) -> Option<(&Task, DateTime<Utc>)> {
        self.pending_delete.peek()
    }

    pub fn pending_confirmation(&self) -> Option<Uuid> {
        self.pending_confirm
    }

    /// Creates or updates a task from a complete editor record.
    #[instrument(skip(self, task), fields(task = %task.id))]
    pub fn save(&mut self, mut task: Task) -> anyhow::Result<SaveOutcome> {
        task.validate()?;
        self.tick();
        let now = self.now();
        task.normalize_completion(now);

        if self
            .pending_delete
            .peek()
            .is_some_and(|(tombstoned, _)| tombstoned.id == task.id)
        {
            debug!("saved task was awaiting deletion; dropping tombstone");
            self.pending_delete.cancel();
            self.store.save_tombstone_best_effort(None);
        }

        let outcome = match self.tasks.iter_mut().find(|existing| existing.id == task.id) {
            Some(existing) => {
                *existing = task.clone();
                SaveOutcome::Updated
            }
            None => {
                self.tasks.insert(0, task.clone());
                SaveOutcome::Created
            }
        };

        let reminder = match outcome {
            SaveOutcome::Created => self.scheduler.schedule_for_task(&task, now),
            SaveOutcome::Updated => self.scheduler.reconcile(&task, now),
        };
        info!(?outcome, ?reminder, "task saved");

        self.changed();
        Ok(outcome)
    }

    /// Flips completion; returns the new `completed` value.
    #[instrument(skip(self))]
    pub fn toggle_complete(&mut self, id: Uuid) -> anyhow::Result<bool> {
        self.tick();
        let now = self.now();
        let task = self
            .tasks
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or_else(|| anyhow!("task not found: {id}"))?;

        let completed = task.toggle_completed(now);
        let task = task.clone();
        let reminder = if completed {
            self.scheduler.cancel_for_task(id)
        } else {
            self.scheduler.schedule_for_task(&task, now)
        };
        info!(completed, ?reminder, "task toggled");

        self.changed();
        Ok(completed)
    }

    /// Completion callback from the focus timer.
    #[instrument(skip(self))]
    pub fn finish_focus(&mut self, id: Uuid) -> anyhow::Result<()> {
        let already_done = self
            .get(id)
            .ok_or_else(|| anyhow!("task not found: {id}"))?
            .completed;
        if already_done {
            debug!("focus finished on a completed task; nothing to do");
            return Ok(());
        }
        self.toggle_complete(id).map(|_| ())
    }

    /// First phase of a delete: remembers which task the user wants gone.
    pub fn request_delete(&mut self, id: Uuid) -> anyhow::Result<()> {
        if self.get(id).is_none() {
            return Err(anyhow!("task not found: {id}"));
        }
        debug!(task = %id, "delete requested");
        self.pending_confirm = Some(id);
        Ok(())
    }

    pub fn cancel_delete(&mut self) -> Option<Uuid> {
        self.pending_confirm.take()
    }

    /// Second phase: removes the requested task now and opens the undo
    /// window. A task already in the window is deleted for good.
    #[instrument(skip(self))]
    pub fn confirm_delete(&mut self) -> anyhow::Result<Task> {
        let id = self
            .pending_confirm
            .take()
            .ok_or_else(|| anyhow!("no delete awaiting confirmation"))?;
        self.tick();
        let now = self.now();

        let idx = self
            .tasks
            .iter()
            .position(|task| task.id == id)
            .ok_or_else(|| anyhow!("task not found: {id}"))?;
        let task = self.tasks.remove(idx);
        self.scheduler.cancel_for_task(task.id);

        let deadline = now + self.options.undo_window;
        if let Some(previous) = self.pending_delete.arm(task.clone(), deadline) {
            info!(task = %previous.id, "earlier deletion made permanent");
        }
        self.store.save_tombstone_best_effort(Some(&Tombstone {
            task: task.clone(),
            deadline,
        }));
        info!(task = %task.id, %deadline, "task deleted; undo window open");

        self.changed();
        Ok(task)
    }

    /// Restores the task in the undo window to the front of the collection.
    #[instrument(skip(self))]
    pub fn undo_delete(&mut self) -> Option<Task> {
        self.tick();
        let task = self.pending_delete.cancel()?;
        let now = self.now();
        self.store.save_tombstone_best_effort(None);

        self.tasks.insert(0, task.clone());
        let reminder = self.scheduler.reconcile(&task, now);
        info!(task = %task.id, ?reminder, "deletion undone");

        self.changed();
        Some(task)
    }

    /// Expires the pending deletion once its window has passed. Returns the
    /// task that is now gone for good.
    pub fn tick(&mut self) -> Option<Task> {
        let expired = self.pending_delete.poll(self.clock.now())?;
        self.store.save_tombstone_best_effort(None);
        self.scheduler.cancel_for_task(expired.id);
        info!(task = %expired.id, "undo window elapsed; deletion is permanent");
        Some(expired)
    }

    fn changed(&mut self) {
        self.store.save_tasks_best_effort(&self.tasks);
        self.feed.publish(self.snapshot());
    }
}

fn dedupe_by_id(tasks: Vec<Task>) -> Vec<Task> {
    let mut seen = HashSet::new();
    let before = tasks.len();
    let kept: Vec<Task> = tasks
        .into_iter()
        .filter(|task| seen.insert(task.id))
        .collect();
    if kept.len() != before {
        warn!(dropped = before - kept.len(), "dropped duplicate task ids on load");
    }
    kept
}

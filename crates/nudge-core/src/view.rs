use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{
  DateTime,
  Utc
};
use tracing::trace;

use crate::datetime::Calendar;
use crate::task::Task;

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
)]
pub enum ViewFilter {
  #[default]
  All,
  Today,
  Upcoming,
  Completed
}

impl ViewFilter {
  pub fn as_str(self) -> &'static str {
    match self {
      | ViewFilter::All => "all",
      | ViewFilter::Today => "today",
      | ViewFilter::Upcoming => {
        "upcoming"
      }
      | ViewFilter::Completed => {
        "completed"
      }
    }
  }

  pub fn matches(
    self,
    task: &Task,
    now: DateTime<Utc>,
    calendar: &Calendar
  ) -> bool {
    match self {
      | ViewFilter::All => true,
      | ViewFilter::Today => {
        !task.completed
          && task.due.is_some_and(
            |due| {
              calendar
                .same_day(due, now)
            }
          )
      }
      | ViewFilter::Upcoming => {
        !task.completed
          && task.due.is_some_and(
            |due| {
              due > now
                && !calendar
                  .same_day(due, now)
            }
          )
      }
      | ViewFilter::Completed => {
        task.completed
      }
    }
  }
}

impl fmt::Display for ViewFilter {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>
  ) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ViewFilter {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    match s
      .trim()
      .to_ascii_lowercase()
      .as_str()
    {
      | "all" => Ok(ViewFilter::All),
      | "today" => Ok(ViewFilter::Today),
      | "upcoming" => {
        Ok(ViewFilter::Upcoming)
      }
      | "completed" | "done" => {
        Ok(ViewFilter::Completed)
      }
      | other => {
        Err(anyhow!(
          "unknown filter: {other} \
           (expected all, today, \
           upcoming, completed)"
        ))
      }
    }
  }
}

/// Filters and orders `tasks` for
/// display.
///
/// Order: priority (high, medium,
/// low); inside a priority band tasks
/// are laid out newest-created first,
/// and the positions held by dated
/// tasks are then refilled with those
/// same tasks in due order. Both passes
/// are stable sorts over total orders,
/// so equal keys keep input order.
#[tracing::instrument(skip(
  tasks, now, calendar
))]
pub fn project(
  tasks: &[Task],
  filter: ViewFilter,
  now: DateTime<Utc>,
  calendar: &Calendar
) -> Vec<Task> {
  let mut out: Vec<Task> = tasks
    .iter()
    .filter(|task| {
      filter.matches(task, now, calendar)
    })
    .cloned()
    .collect();

  out.sort_by(|a, b| {
    a.priority
      .rank()
      .cmp(&b.priority.rank())
      .then_with(|| {
        b.created_at.cmp(&a.created_at)
      })
  });

  let mut start = 0;
  while start < out.len() {
    let rank = out[start].priority.rank();
    let end = out[start..]
      .iter()
      .position(|task| {
        task.priority.rank() != rank
      })
      .map(|offset| start + offset)
      .unwrap_or(out.len());
    order_dated_slots(
      &mut out[start..end]
    );
    start = end;
  }

  trace!(
    filter = %filter,
    shown = out.len(),
    total = tasks.len(),
    "projected view"
  );
  out
}

fn order_dated_slots(band: &mut [Task]) {
  let slots: Vec<usize> = band
    .iter()
    .enumerate()
    .filter(|(_, task)| {
      task.due.is_some()
    })
    .map(|(idx, _)| idx)
    .collect();
  if slots.len() < 2 {
    return;
  }

  let mut dated: Vec<Task> = slots
    .iter()
    .map(|&idx| band[idx].clone())
    .collect();
  dated.sort_by_key(|task| task.due);

  for (slot, task) in
    slots.into_iter().zip(dated)
  {
    band[slot] = task;
  }
}

/// Counts shown on summary screens.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq,
)]
pub struct Stats {
  pub total:            usize,
  pub completed:        usize,
  pub pending:          usize,
  pub percent_complete: u8,
  pub due_today:        usize,
  pub overdue:          usize
}

pub fn stats(
  tasks: &[Task],
  now: DateTime<Utc>,
  calendar: &Calendar
) -> Stats {
  let total = tasks.len();
  let completed = tasks
    .iter()
    .filter(|task| task.completed)
    .count();
  let due_today = tasks
    .iter()
    .filter(|task| {
      ViewFilter::Today
        .matches(task, now, calendar)
    })
    .count();
  let overdue = tasks
    .iter()
    .filter(|task| {
      !task.completed
        && task
          .due
          .is_some_and(|due| due < now)
    })
    .count();
  let percent_complete = if total == 0 {
    0
  } else {
    ((completed as f64 / total as f64)
      * 100.0)
      .round() as u8
  };

  Stats {
    total,
    completed,
    pending: total - completed,
    percent_complete,
    due_today,
    overdue
  }
}

#[cfg(test)]
mod tests {
  use chrono::{
    Duration,
    TimeZone,
    Utc
  };

  use super::*;
  use crate::task::Priority;

  fn now() -> DateTime<Utc> {
    Utc
      .with_ymd_and_hms(
        2026, 3, 4, 10, 0, 0
      )
      .unwrap()
  }

  fn task(
    title: &str,
    priority: Priority,
    due: Option<DateTime<Utc>>,
    created_offset_mins: i64
  ) -> Task {
    let mut t = Task::new(
      title,
      now()
        + Duration::minutes(
          created_offset_mins
        )
    );
    t.priority = priority;
    t.due = due;
    t
  }

  fn titles(tasks: &[Task]) -> Vec<&str> {
    tasks
      .iter()
      .map(|t| t.title.as_str())
      .collect()
  }

  #[test]
  fn priority_then_due_order() {
    let tomorrow =
      now() + Duration::days(1);
    let today_later =
      now() + Duration::hours(3);
    let tasks = vec![
      task(
        "1",
        Priority::High,
        Some(tomorrow),
        0
      ),
      task(
        "2",
        Priority::Low,
        Some(today_later),
        0
      ),
      task(
        "3",
        Priority::High,
        Some(today_later),
        0
      ),
    ];

    let out = project(
      &tasks,
      ViewFilter::All,
      now(),
      &Calendar::utc()
    );
    assert_eq!(
      titles(&out),
      vec!["3", "1", "2"]
    );
  }

  #[test]
  fn undated_tasks_newest_first() {
    let tasks = vec![
      task("old", Priority::Medium, None, -60),
      task("new", Priority::Medium, None, -5),
      task("urgent", Priority::High, None, -90),
    ];

    let out = project(
      &tasks,
      ViewFilter::All,
      now(),
      &Calendar::utc()
    );
    assert_eq!(
      titles(&out),
      vec!["urgent", "new", "old"]
    );
  }

  #[test]
  fn mixed_pair_follows_creation_time() {
    let tasks = vec![
      task(
        "dated-older",
        Priority::Medium,
        Some(now() + Duration::hours(1)),
        -30
      ),
      task(
        "undated-newer",
        Priority::Medium,
        None,
        -10
      ),
    ];

    let out = project(
      &tasks,
      ViewFilter::All,
      now(),
      &Calendar::utc()
    );
    assert_eq!(
      titles(&out),
      vec!["undated-newer", "dated-older"]
    );
  }

  #[test]
  fn yesterday_is_only_in_all() {
    let tasks = vec![task(
      "late",
      Priority::Medium,
      Some(now() - Duration::days(1)),
      -3000
    )];
    let cal = Calendar::utc();

    assert!(
      project(
        &tasks,
        ViewFilter::Today,
        now(),
        &cal
      )
      .is_empty()
    );
    assert!(
      project(
        &tasks,
        ViewFilter::Upcoming,
        now(),
        &cal
      )
      .is_empty()
    );
    assert_eq!(
      project(
        &tasks,
        ViewFilter::All,
        now(),
        &cal
      )
      .len(),
      1
    );
  }

  #[test]
  fn today_upcoming_completed_partition() {
    let cal = Calendar::utc();
    let earlier_today =
      now() - Duration::hours(2);
    let mut done = task(
      "done",
      Priority::Medium,
      Some(now() + Duration::days(2)),
      0
    );
    done.mark_completed(now());
    let tasks = vec![
      task(
        "this-morning",
        Priority::Medium,
        Some(earlier_today),
        0
      ),
      task(
        "next-week",
        Priority::Medium,
        Some(now() + Duration::days(7)),
        0
      ),
      task(
        "tonight",
        Priority::Medium,
        Some(now() + Duration::hours(8)),
        0
      ),
      done,
    ];

    let today = project(
      &tasks,
      ViewFilter::Today,
      now(),
      &cal
    );
    assert_eq!(
      titles(&today),
      vec!["this-morning", "tonight"]
    );

    let upcoming = project(
      &tasks,
      ViewFilter::Upcoming,
      now(),
      &cal
    );
    assert_eq!(
      titles(&upcoming),
      vec!["next-week"]
    );

    let completed = project(
      &tasks,
      ViewFilter::Completed,
      now(),
      &cal
    );
    assert_eq!(
      titles(&completed),
      vec!["done"]
    );
  }

  #[test]
  fn projection_is_repeatable() {
    let tasks = vec![
      task("a", Priority::Low, None, 0),
      task("b", Priority::Low, None, 0),
      task(
        "c",
        Priority::High,
        Some(now() + Duration::hours(1)),
        0
      ),
    ];
    let cal = Calendar::utc();

    let first = project(
      &tasks,
      ViewFilter::All,
      now(),
      &cal
    );
    let second = project(
      &tasks,
      ViewFilter::All,
      now(),
      &cal
    );
    assert_eq!(first, second);
    assert_eq!(
      titles(&first),
      vec!["c", "a", "b"]
    );
  }

  #[test]
  fn stats_counts() {
    let mut done = task(
      "done",
      Priority::Medium,
      None,
      0
    );
    done.mark_completed(now());
    let tasks = vec![
      done,
      task(
        "overdue",
        Priority::Medium,
        Some(now() - Duration::hours(1)),
        0
      ),
      task("open", Priority::Low, None, 0),
    ];

    let s =
      stats(&tasks, now(), &Calendar::utc());
    assert_eq!(s.total, 3);
    assert_eq!(s.completed, 1);
    assert_eq!(s.pending, 2);
    assert_eq!(s.percent_complete, 33);
    assert_eq!(s.due_today, 1);
    assert_eq!(s.overdue, 1);

    assert_eq!(
      stats(&[], now(), &Calendar::utc())
        .percent_complete,
      0
    );
  }

  #[test]
  fn parses_filter_names() {
    assert_eq!(
      "Upcoming"
        .parse::<ViewFilter>()
        .unwrap(),
      ViewFilter::Upcoming
    );
    assert!(
      "soon"
        .parse::<ViewFilter>()
        .is_err()
    );
  }
}

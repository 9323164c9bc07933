use std::io::{self, IsTerminal, Write};

use chrono::{DateTime, Utc};
use tracing::warn;
use unicode_width::UnicodeWidthStr;

use crate::config::Config;
use crate::datetime::Calendar;
use crate::notify::Reminder;
use crate::profile::UserProfile;
use crate::task::{Priority, Task};
use crate::view::Stats;

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
    calendar: Calendar,
}

impl Renderer {
    pub fn new(cfg: &Config, calendar: Calendar) -> anyhow::Result<Self> {
        Ok(Self {
            color: cfg.color_enabled()?,
            calendar,
        })
    }

    #[tracing::instrument(skip(self, tasks, now))]
    pub fn print_task_table(&mut self, tasks: &[Task], now: DateTime<Utc>) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();

        if tasks.is_empty() {
            writeln!(out, "No tasks.")?;
            return Ok(());
        }

        let headers = vec![
            "ID".to_string(),
            " ".to_string(),
            "Pri".to_string(),
            "Due".to_string(),
            "Category".to_string(),
            "Title".to_string(),
        ];

        let mut rows = Vec::with_capacity(tasks.len());

        for task in tasks {
            let id = self.paint(&task.short_id(), "33");
            let mark = if task.completed { "x" } else { " " }.to_string();

            let priority = match task.priority {
                Priority::High => self.paint("H", "31"),
                Priority::Medium => "M".to_string(),
                Priority::Low => self.paint("L", "2"),
            };

            let due = match task.due {
                Some(due) if due < now && !task.completed => {
                    self.paint(&self.calendar.format(due), "31")
                }
                Some(due) => self.calendar.format(due),
                None => String::new(),
            };

            let category = task.category.map(|c| c.to_string()).unwrap_or_default();
            let mut title = task.title.clone();
            if !task.attachments.is_empty() {
                title.push_str(&format!(" [{}]", task.attachments.len()));
            }

            rows.push(vec![id, mark, priority, due, category, title]);
        }

        write_table(&mut out, headers, rows)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, task))]
    pub fn print_task_info(&mut self, task: &Task) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();

        writeln!(out, "id          {}", task.id)?;
        writeln!(out, "title       {}", task.title)?;
        writeln!(out, "priority    {}", task.priority)?;
        writeln!(
            out,
            "category    {}",
            task.category.map(|c| c.to_string()).unwrap_or_default()
        )?;
        writeln!(out, "completed   {}", if task.completed { "yes" } else { "no" })?;
        writeln!(out, "created     {}", self.calendar.format(task.created_at))?;

        if let Some(due) = task.due {
            writeln!(out, "due         {}", self.calendar.format(due))?;
        }
        if let Some(done) = task.completed_at {
            writeln!(out, "completed@  {}", self.calendar.format(done))?;
        }
        if let Some(notes) = &task.notes {
            writeln!(out, "notes       {notes}")?;
        }
        for (idx, attachment) in task.attachments.iter().enumerate() {
            let size = match attachment.decode() {
                Ok(bytes) => format!("{} bytes", bytes.len()),
                Err(err) => {
                    warn!(task = %task.id, idx, error = %format!("{err:#}"), "unreadable attachment");
                    self.paint("unreadable", "31")
                }
            };
            writeln!(out, "attachment  [{idx}] {} ({size})", attachment.media_type())?;
        }

        Ok(())
    }

    pub fn print_stats(&mut self, stats: &Stats) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(
            out,
            "{}% complete ({} of {})",
            stats.percent_complete, stats.completed, stats.total
        )?;
        writeln!(out, "pending     {}", stats.pending)?;
        writeln!(out, "due today   {}", stats.due_today)?;
        writeln!(out, "overdue     {}", stats.overdue)?;
        Ok(())
    }

    pub fn print_reminders(&mut self, reminders: &[Reminder]) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        if reminders.is_empty() {
            writeln!(out, "No pending reminders.")?;
            return Ok(());
        }

        let headers = vec!["Fires".to_string(), "Task".to_string(), "Title".to_string()];
        let rows = reminders
            .iter()
            .map(|reminder| {
                vec![
                    self.calendar.format(reminder.fire_at),
                    reminder.task_id.simple().to_string()[..8].to_string(),
                    reminder.title.clone(),
                ]
            })
            .collect();
        write_table(&mut out, headers, rows)
    }

    pub fn print_profile(&mut self, profile: Option<&UserProfile>) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        match profile {
            Some(profile) => {
                writeln!(out, "name        {}", profile.name)?;
                writeln!(out, "since       {}", self.calendar.format(profile.created_at))?;
            }
            None => writeln!(out, "No profile yet. Create one with `nudge profile --name NAME`.")?,
        }
        Ok(())
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color || !io::stdout().is_terminal() {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

fn write_table<W: Write>(
    mut writer: W,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths = vec![0usize; column_count];

    for (idx, header) in headers.iter().enumerate() {
        widths[idx] = widths[idx].max(UnicodeWidthStr::width(header.as_str()));
    }

    for row in &rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    for idx in 0..column_count {
        write!(writer, "{:width$} ", headers[idx], width = widths[idx])?;
    }
    writeln!(writer)?;

    for idx in 0..column_count {
        write!(writer, "{:-<width$} ", "", width = widths[idx])?;
    }
    writeln!(writer)?;

    for row in rows {
        for idx in 0..column_count {
            let cell = &row[idx];
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = widths[idx].saturating_sub(visible_width);
            write!(writer, "{}{} ", cell, " ".repeat(padding))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_pads_by_visible_width() {
        let mut buf = Vec::new();
        write_table(
            &mut buf,
            vec!["ID".to_string(), "Title".to_string()],
            vec![vec!["\x1b[33mab\x1b[0m".to_string(), "日本語".to_string()]],
        )
        .unwrap();

        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ID Title  ");
        assert_eq!(lines[1], "-- ------ ");
        assert!(lines[2].ends_with("\x1b[0m 日本語 "));
    }
}

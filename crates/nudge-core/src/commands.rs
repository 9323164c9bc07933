use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cli::{AddArgs, Command, EditArgs, ThemeMode};
use crate::clock::SystemClock;
use crate::config::Config;
use crate::datastore::{DataStore, TaskStore, WriteBehind};
use crate::datetime::{Calendar, parse_date_expr};
use crate::lifecycle::{ManagerOptions, SaveOutcome, TaskManager};
use crate::notify::{Reminder, SpoolHost};
use crate::profile::UserProfile;
use crate::render::Renderer;
use crate::task::{Attachment, Task};
use crate::view::ViewFilter;

#[instrument(skip(store, cfg, calendar, renderer, command))]
pub fn dispatch(
    store: DataStore,
    cfg: &Config,
    calendar: Calendar,
    renderer: &mut Renderer,
    command: Option<Command>,
) -> anyhow::Result<()> {
    let options = ManagerOptions {
        undo_window: cfg.undo_window()?,
        calendar,
    };
    let host = SpoolHost::new(&store.data_dir, cfg.reminders_enabled()?);
    let mut manager = TaskManager::open(
        Box::new(WriteBehind::new(store.clone())),
        Box::new(host),
        Arc::new(SystemClock),
        options,
    );
    if let Some(expired) = manager.tick() {
        debug!(task = %expired.id, "pending deletion expired before this run");
    }

    let command = command.unwrap_or(Command::List { filter: None });
    debug!(?command, "dispatching");

    match command {
        Command::Add(args) => cmd_add(&mut manager, args),
        Command::Edit(args) => cmd_edit(&mut manager, args),
        Command::List { filter } => {
            let filter = match filter {
                Some(filter) => filter,
                None => cfg.default_filter()?,
            };
            cmd_list(&manager, renderer, filter)
        }
        Command::Info { id } => {
            let id = resolve_id(manager.tasks(), &id)?;
            let task = manager
                .get(id)
                .ok_or_else(|| anyhow!("task not found: {id}"))?;
            renderer.print_task_info(task)
        }
        Command::Toggle { id } => {
            let id = resolve_id(manager.tasks(), &id)?;
            let completed = manager.toggle_complete(id)?;
            let title = task_title(&manager, id);
            if completed {
                println!("Completed '{title}'.");
            } else {
                println!("Reopened '{title}'.");
            }
            Ok(())
        }
        Command::FocusDone { id } => {
            let id = resolve_id(manager.tasks(), &id)?;
            manager.finish_focus(id)?;
            println!("Focus session finished; '{}' is done.", task_title(&manager, id));
            Ok(())
        }
        Command::Delete { id, yes } => cmd_delete(&mut manager, &id, yes),
        Command::Undo => cmd_undo(&mut manager),
        Command::Stats => renderer.print_stats(&manager.stats()),
        Command::Reminders => {
            let reminders: Vec<Reminder> = manager.scheduler().reminders().cloned().collect();
            renderer.print_reminders(&reminders)
        }
        Command::Profile { name } => cmd_profile(&store, renderer, &manager, name),
        Command::Theme { mode } => cmd_theme(&store, mode),
    }
}

#[instrument(skip(manager, args))]
fn cmd_add(manager: &mut TaskManager, args: AddArgs) -> anyhow::Result<()> {
    info!("command add");
    let now = manager.now();

    let mut task = Task::new(args.title.join(" "), now);
    task.notes = args.notes.filter(|notes| !notes.trim().is_empty());
    if let Some(due) = args.due {
        task.due = Some(parse_date_expr(&due, now, manager.calendar())?);
    }
    if let Some(priority) = args.priority {
        task.priority = priority;
    }
    task.category = args.category;
    for path in &args.attach {
        task.push_attachment(read_attachment(path)?);
    }

    let short = task.short_id();
    manager.save(task)?;
    println!("Created task {short}.");
    Ok(())
}

#[instrument(skip(manager, args))]
fn cmd_edit(manager: &mut TaskManager, args: EditArgs) -> anyhow::Result<()> {
    info!("command edit");
    let now = manager.now();
    let id = resolve_id(manager.tasks(), &args.id)?;
    let mut task = manager
        .get(id)
        .cloned()
        .ok_or_else(|| anyhow!("task not found: {id}"))?;

    if let Some(title) = args.title {
        task.title = title;
    }
    if args.clear_notes {
        task.notes = None;
    } else if let Some(notes) = args.notes {
        task.notes = Some(notes);
    }
    if args.clear_due {
        task.due = None;
    } else if let Some(due) = args.due {
        task.due = Some(parse_date_expr(&due, now, manager.calendar())?);
    }
    if let Some(priority) = args.priority {
        task.priority = priority;
    }
    if args.clear_category {
        task.category = None;
    } else if let Some(category) = args.category {
        task.category = Some(category);
    }

    let mut detach = args.detach;
    detach.sort_unstable();
    detach.dedup();
    for index in detach.into_iter().rev() {
        task.remove_attachment(index)
            .ok_or_else(|| anyhow!("no attachment at index {index}"))?;
    }
    for path in &args.attach {
        task.push_attachment(read_attachment(path)?);
    }

    match manager.save(task)? {
        SaveOutcome::Updated => println!("Modified task {}.", &id.simple().to_string()[..8]),
        SaveOutcome::Created => println!("Recreated task {}.", &id.simple().to_string()[..8]),
    }
    Ok(())
}

#[instrument(skip(manager, renderer))]
fn cmd_list(manager: &TaskManager, renderer: &mut Renderer, filter: ViewFilter) -> anyhow::Result<()> {
    info!("command list");
    let tasks = manager.view(filter);
    renderer.print_task_table(&tasks, manager.now())?;
    if let Some((task, deadline)) = manager.pending_deletion() {
        let left = (deadline - manager.now()).num_seconds().max(0);
        println!("Deleted '{}'. Run `nudge undo` within {left}s to restore it.", task.title);
    }
    Ok(())
}

#[instrument(skip(manager))]
fn cmd_delete(manager: &mut TaskManager, token: &str, yes: bool) -> anyhow::Result<()> {
    info!("command delete");
    let id = resolve_id(manager.tasks(), token)?;
    manager.request_delete(id)?;

    if !yes && !confirm(&format!("Delete task '{}'?", task_title(manager, id)))? {
        manager.cancel_delete();
        println!("Task not deleted.");
        return Ok(());
    }

    let task = manager.confirm_delete()?;
    let window = manager
        .pending_deletion()
        .map(|(_, deadline)| (deadline - manager.now()).num_seconds().max(0))
        .unwrap_or_default();
    println!(
        "Deleted '{}'. Run `nudge undo` within {window}s to restore it.",
        task.title
    );
    Ok(())
}

#[instrument(skip(manager))]
fn cmd_undo(manager: &mut TaskManager) -> anyhow::Result<()> {
    info!("command undo");
    match manager.undo_delete() {
        Some(task) => println!("Restored '{}'.", task.title),
        None => println!("Nothing to undo."),
    }
    Ok(())
}

#[instrument(skip(store, renderer, manager, name))]
fn cmd_profile(
    store: &DataStore,
    renderer: &mut Renderer,
    manager: &TaskManager,
    name: Option<String>,
) -> anyhow::Result<()> {
    let existing = store.load_profile()?;
    let Some(name) = name else {
        return renderer.print_profile(existing.as_ref());
    };

    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("profile name cannot be empty"));
    }

    let profile = match existing {
        Some(mut profile) => {
            info!(from = %profile.name, to = %name, "renaming profile");
            profile.name = name.to_string();
            profile
        }
        None => {
            info!(name = %name, "creating profile");
            UserProfile::new(name, manager.now())
        }
    };
    store.save_profile(&profile)?;
    renderer.print_profile(Some(&profile))
}

#[instrument(skip(store))]
fn cmd_theme(store: &DataStore, mode: Option<ThemeMode>) -> anyhow::Result<()> {
    let mut settings = store.load_settings()?;

    if let Some(mode) = mode {
        settings.dark_mode = match mode {
            ThemeMode::On => Some(true),
            ThemeMode::Off => Some(false),
            ThemeMode::System => None,
        };
        store.save_settings(&settings)?;
    }

    let label = match settings.dark_mode {
        Some(true) => "dark",
        Some(false) => "light",
        None => "system",
    };
    println!("Theme: {label}");
    Ok(())
}

/// Accepts a full UUID or any unique prefix of its hex form.
fn resolve_id(tasks: &[Task], token: &str) -> anyhow::Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(token) {
        return Ok(id);
    }

    let needle = token.trim().replace('-', "").to_ascii_lowercase();
    if needle.is_empty() {
        return Err(anyhow!("task id cannot be empty"));
    }

    let mut matches = tasks
        .iter()
        .filter(|task| task.id.simple().to_string().starts_with(&needle))
        .map(|task| task.id);

    let first = matches
        .next()
        .ok_or_else(|| anyhow!("no task matches id '{token}'"))?;
    if matches.next().is_some() {
        return Err(anyhow!("id '{token}' is ambiguous; type more characters"));
    }
    Ok(first)
}

fn task_title(manager: &TaskManager, id: Uuid) -> String {
    manager
        .get(id)
        .map(|task| task.title.clone())
        .unwrap_or_default()
}

/// `--attach` takes a file path, or a `data:` URL copied from elsewhere.
fn read_attachment(path: &Path) -> anyhow::Result<Attachment> {
    if let Some(raw) = path.to_str()
        && raw.starts_with("data:")
    {
        return Attachment::from_data_url(raw);
    }
    Attachment::from_file(path).with_context(|| format!("failed to attach {}", path.display()))
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    let mut out = io::stdout().lock();
    write!(out, "{prompt} (y/N) ")?;
    out.flush()?;

    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer)? == 0 {
        warn!("no answer on stdin; treating as no");
        return Ok(false);
    }
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn resolves_unique_prefixes() {
        let a = Task::new("a", Utc::now());
        let b = Task::new("b", Utc::now());
        let tasks = vec![a.clone(), b.clone()];

        let a_hex = a.id.simple().to_string();
        assert_eq!(resolve_id(&tasks, &a_hex[..12]).unwrap(), a.id);
        assert_eq!(resolve_id(&tasks, &a.id.to_string()).unwrap(), a.id);
        assert!(resolve_id(&tasks, "").is_err());
        assert!(resolve_id(&tasks, "zz").is_err());
    }

    #[test]
    fn attach_accepts_paths_and_data_urls() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("scan.png");
        std::fs::write(&path, b"png").unwrap();

        let from_file = read_attachment(&path).unwrap();
        assert_eq!(from_file.media_type(), "image/png");
        assert_eq!(from_file.decode().unwrap(), b"png".to_vec());

        let inline = read_attachment(Path::new("data:image/gif;base64,R0lG")).unwrap();
        assert_eq!(inline.media_type(), "image/gif");
        assert_eq!(inline.decode().unwrap(), b"GIF".to_vec());

        assert!(read_attachment(Path::new("data:nonsense")).is_err());
        assert!(read_attachment(&temp.path().join("missing.png")).is_err());
    }

    #[test]
    fn shared_prefix_is_ambiguous() {
        let mut a = Task::new("a", Utc::now());
        let mut b = Task::new("b", Utc::now());
        a.id = Uuid::parse_str("abcd0000-0000-4000-8000-000000000001").unwrap();
        b.id = Uuid::parse_str("abcd0000-0000-4000-8000-000000000002").unwrap();
        let tasks = vec![a.clone(), b];

        assert!(resolve_id(&tasks, "abcd").is_err());
        assert_eq!(
            resolve_id(&tasks, "abcd0000000040008000000000000001").unwrap(),
            a.id
        );
    }
}

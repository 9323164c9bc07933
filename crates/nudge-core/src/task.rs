use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::datetime::stamp_serde;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Display rank; lower sorts first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l" | "low" => Ok(Priority::Low),
            "m" | "med" | "medium" => Ok(Priority::Medium),
            "h" | "high" => Ok(Priority::High),
            other => Err(anyhow!("unknown priority: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Work,
    Personal,
    Study,
    Shopping,
    #[serde(alias = "others")]
    Other,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Work => "work",
            Category::Personal => "personal",
            Category::Study => "study",
            Category::Shopping => "shopping",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "work" => Ok(Category::Work),
            "personal" => Ok(Category::Personal),
            "study" => Ok(Category::Study),
            "shopping" => Ok(Category::Shopping),
            "other" | "others" => Ok(Category::Other),
            other => Err(anyhow!("unknown category: {other}")),
        }
    }
}

/// An image blob kept as a `data:` URL, the same shape the editor hands over.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Attachment(String);

impl Attachment {
    pub fn from_bytes(media_type: &str, bytes: &[u8]) -> Self {
        Self(format!("data:{media_type};base64,{}", STANDARD.encode(bytes)))
    }

    #[tracing::instrument(skip(path), fields(path = %path.display()))]
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read attachment {}", path.display()))?;
        Ok(Self::from_bytes(guess_media_type(path), &bytes))
    }

    pub fn from_data_url(raw: impl Into<String>) -> anyhow::Result<Self> {
        let raw = raw.into();
        if !raw.starts_with("data:") || !raw.contains(";base64,") {
            return Err(anyhow!("attachment is not a base64 data url"));
        }
        Ok(Self(raw))
    }

    pub fn media_type(&self) -> &str {
        self.0
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(";base64,"))
            .map(|(mime, _)| mime)
            .unwrap_or("application/octet-stream")
    }

    pub fn decode(&self) -> anyhow::Result<Vec<u8>> {
        let (_, payload) = self
            .0
            .split_once(";base64,")
            .ok_or_else(|| anyhow!("attachment is not a base64 data url"))?;
        STANDARD
            .decode(payload)
            .context("attachment payload is not valid base64")
    }

    pub fn as_data_url(&self) -> &str {
        &self.0
    }
}

fn guess_media_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: Uuid,

    pub title: String,

    #[serde(default)]
    pub notes: Option<String>,

    #[serde(default, with = "stamp_serde::option")]
    pub due: Option<DateTime<Utc>>,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub category: Option<Category>,

    #[serde(default)]
    pub attachments: Vec<Attachment>,

    #[serde(default)]
    pub completed: bool,

    #[serde(default, with = "stamp_serde::option")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(with = "stamp_serde")]
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            notes: None,
            due: None,
            priority: Priority::default(),
            category: None,
            attachments: vec![],
            completed: false,
            completed_at: None,
            created_at: now,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.title.trim().is_empty() {
            return Err(anyhow!("task title cannot be empty"));
        }
        Ok(())
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        if !self.completed {
            self.completed = true;
            self.completed_at = Some(now);
        }
    }

    pub fn mark_incomplete(&mut self) {
        self.completed = false;
        self.completed_at = None;
    }

    /// Flips completion and returns the new state.
    pub fn toggle_completed(&mut self, now: DateTime<Utc>) -> bool {
        if self.completed {
            self.mark_incomplete();
        } else {
            self.mark_completed(now);
        }
        self.completed
    }

    /// Repairs `completed_at` so it is present exactly when `completed` is.
    pub fn normalize_completion(&mut self, now: DateTime<Utc>) {
        match (self.completed, self.completed_at) {
            (true, None) => self.completed_at = Some(now),
            (false, Some(_)) => self.completed_at = None,
            _ => {}
        }
    }

    /// Whether a reminder should be pending for this task at `now`.
    pub fn wants_reminder(&self, now: DateTime<Utc>) -> bool {
        !self.completed && self.due.map(|due| due > now).unwrap_or(false)
    }

    pub fn push_attachment(&mut self, attachment: Attachment) {
        self.attachments.push(attachment);
    }

    pub fn remove_attachment(&mut self, index: usize) -> Option<Attachment> {
        if index < self.attachments.len() {
            Some(self.attachments.remove(index))
        } else {
            None
        }
    }

    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap()
    }

    #[test]
    fn toggle_sets_and_clears_completed_at() {
        let mut task = Task::new("water plants", now());
        assert!(task.toggle_completed(now()));
        assert_eq!(task.completed_at, Some(now()));

        assert!(!task.toggle_completed(now() + Duration::hours(1)));
        assert_eq!(task.completed_at, None);
    }

    #[test]
    fn normalize_repairs_both_directions() {
        let mut task = Task::new("a", now());
        task.completed = true;
        task.normalize_completion(now());
        assert_eq!(task.completed_at, Some(now()));

        task.completed = false;
        task.normalize_completion(now());
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn blank_title_is_rejected() {
        let task = Task::new("   ", now());
        assert!(task.validate().is_err());
    }

    #[test]
    fn reminder_wanted_only_for_future_open_tasks() {
        let mut task = Task::new("call mom", now());
        assert!(!task.wants_reminder(now()));

        task.due = Some(now() - Duration::minutes(1));
        assert!(!task.wants_reminder(now()));

        task.due = Some(now() + Duration::minutes(1));
        assert!(task.wants_reminder(now()));

        task.mark_completed(now());
        assert!(!task.wants_reminder(now()));
    }

    #[test]
    fn attachment_data_url_round_trips_bytes() {
        let att = Attachment::from_bytes("image/png", &[0x89, b'P', b'N', b'G']);
        assert_eq!(att.media_type(), "image/png");
        assert_eq!(att.decode().unwrap(), vec![0x89, b'P', b'N', b'G']);
        assert!(Attachment::from_data_url("not-a-url").is_err());
    }

    #[test]
    fn remove_attachment_by_index() {
        let mut task = Task::new("receipt", now());
        task.push_attachment(Attachment::from_bytes("image/png", b"one"));
        task.push_attachment(Attachment::from_bytes("image/png", b"two"));

        let removed = task.remove_attachment(0).unwrap();
        assert_eq!(removed.decode().unwrap(), b"one".to_vec());
        assert_eq!(task.attachments.len(), 1);
        assert!(task.remove_attachment(5).is_none());
    }

    #[test]
    fn legacy_category_alias_deserializes() {
        let parsed: Category = serde_json::from_str("\"others\"").unwrap();
        assert_eq!(parsed, Category::Other);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
    }
}

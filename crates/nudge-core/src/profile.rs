use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::datetime::stamp_serde;

/// The single user record created during onboarding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub name: String,
    #[serde(with = "stamp_serde")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub onboarded: bool,
}

impl UserProfile {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            created_at: now,
            onboarded: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// `None` follows the system appearance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dark_mode: Option<bool>,
}

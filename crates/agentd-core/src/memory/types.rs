//! Memory type definitions

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Memory category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    Personal,
    Family,
    Career,
    Education,
    Interests,
    Preferences,
    Goals,
    Finance,
    Health,
    Schedule,
    Context,
    Relationships,
    Emotions,
}

impl MemoryCategory {
    pub const ALL: [MemoryCategory; 13] = [
        MemoryCategory::Personal,
        MemoryCategory::Family,
        MemoryCategory::Career,
        MemoryCategory::Education,
        MemoryCategory::Interests,
        MemoryCategory::Preferences,
        MemoryCategory::Goals,
        MemoryCategory::Finance,
        MemoryCategory::Health,
        MemoryCategory::Schedule,
        MemoryCategory::Context,
        MemoryCategory::Relationships,
        MemoryCategory::Emotions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Personal => "personal",
            MemoryCategory::Family => "family",
            MemoryCategory::Career => "career",
            MemoryCategory::Education => "education",
            MemoryCategory::Interests => "interests",
            MemoryCategory::Preferences => "preferences",
            MemoryCategory::Goals => "goals",
            MemoryCategory::Finance => "finance",
            MemoryCategory::Health => "health",
            MemoryCategory::Schedule => "schedule",
            MemoryCategory::Context => "context",
            MemoryCategory::Relationships => "relationships",
            MemoryCategory::Emotions => "emotions",
        }
    }
}

/// Memory visibility level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Usable in shared/group context
    Public,
    /// Private conversations only
    Private,
}

/// Default visibility per category; career-adjacent facts are public
pub fn default_visibility(category: MemoryCategory) -> Visibility {
    match category {
        MemoryCategory::Career
        | MemoryCategory::Interests
        | MemoryCategory::Goals
        | MemoryCategory::Education => Visibility::Public,
        _ => Visibility::Private,
    }
}

/// How a memory was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// The user stated it directly
    Explicit,
    /// Inferred from conversation
    Inferred,
}

/// A structured fact about a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub content: String,
    pub category: MemoryCategory,
    pub visibility: Visibility,
    pub source_type: SourceType,
    /// How confident the system is in this fact, 0.0..=1.0
    pub confidence: f64,
    pub user_confirmed: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub valid_from: NaiveDate,
    pub valid_until: Option<NaiveDate>,
    /// Memory this one replaces
    pub supersedes_id: Option<String>,
    /// Memory that replaced this one
    pub superseded_by_id: Option<String>,
}

impl Memory {
    /// A memory is current while nothing has superseded it
    pub fn is_active(&self) -> bool {
        self.superseded_by_id.is_none()
    }
}

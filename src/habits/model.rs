use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const TITLE_MAX_CHARS: usize = 100;
pub const DESCRIPTION_MAX_CHARS: usize = 500;
pub const DEFAULT_COLOR: &str = "blue";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub const ALL: [Frequency; 3] = [Frequency::Daily, Frequency::Weekly, Frequency::Monthly];

    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            _ => bail!("Unsupported frequency: {raw}. Expected daily|weekly|monthly"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Habit {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub frequency: Frequency,
    pub streak: u32,
    pub color: Option<String>,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HabitCompletion {
    pub id: String,
    pub habit_id: String,
    pub user_id: String,
    pub completed_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

/// Input for a new habit. `streak`, owner and timestamps are assigned on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewHabit {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub frequency: Frequency,
    #[serde(default)]
    pub color: Option<String>,
}

impl NewHabit {
    pub fn new(title: impl Into<String>, frequency: Frequency) -> Self {
        Self {
            title: title.into(),
            description: None,
            frequency,
            color: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_title(&self.title)?;
        self.description
            .as_deref()
            .map(validate_description)
            .transpose()?;
        Ok(())
    }

    /// Trims text fields, drops blank descriptions and fills the colour tag.
    pub fn normalized(&self, default_color: &str) -> Self {
        Self {
            title: self.title.trim().to_string(),
            description: self
                .description
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToOwned::to_owned),
            frequency: self.frequency,
            color: Some(
                self.color
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .unwrap_or(default_color)
                    .to_string(),
            ),
        }
    }
}

/// Partial update of a habit. `None` leaves the column untouched; an empty
/// `description` or `color` clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HabitPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub frequency: Option<Frequency>,
    pub color: Option<String>,
    pub streak: Option<u32>,
}

impl HabitPatch {
    pub fn streak(value: u32) -> Self {
        Self {
            streak: Some(value),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            bail!("Nothing to update");
        }
        self.title.as_deref().map(validate_title).transpose()?;
        self.description
            .as_deref()
            .map(validate_description)
            .transpose()?;
        Ok(())
    }

    pub fn apply(&self, habit: &mut Habit) {
        if let Some(title) = &self.title {
            habit.title = title.trim().to_string();
        }
        if let Some(description) = &self.description {
            habit.description = clearable(description);
        }
        if let Some(frequency) = self.frequency {
            habit.frequency = frequency;
        }
        if let Some(color) = &self.color {
            habit.color = clearable(color);
        }
        if let Some(streak) = self.streak {
            habit.streak = streak;
        }
    }
}

fn clearable(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn validate_title(title: &str) -> Result<()> {
    let length = title.trim().chars().count();
    if length == 0 {
        bail!("Title is required");
    }
    if length > TITLE_MAX_CHARS {
        bail!("Title must be at most {TITLE_MAX_CHARS} characters (got {length})");
    }
    Ok(())
}

fn validate_description(description: &str) -> Result<()> {
    let length = description.trim().chars().count();
    if length > DESCRIPTION_MAX_CHARS {
        bail!("Description must be at most {DESCRIPTION_MAX_CHARS} characters (got {length})");
    }
    Ok(())
}

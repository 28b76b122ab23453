pub const ENABLE_FOREIGN_KEYS: &str = "PRAGMA foreign_keys = ON;";

pub const CREATE_HABITS: &str = r#"
CREATE TABLE IF NOT EXISTS habits (
  id          TEXT PRIMARY KEY,
  title       TEXT NOT NULL CHECK (length(title) BETWEEN 1 AND 100),
  description TEXT CHECK (description IS NULL OR length(description) <= 500),
  frequency   TEXT NOT NULL CHECK (frequency IN ('daily', 'weekly', 'monthly')),
  streak      INTEGER NOT NULL DEFAULT 0 CHECK (streak >= 0),
  color       TEXT DEFAULT 'blue',
  user_id     TEXT NOT NULL,
  created_at  TEXT NOT NULL,
  updated_at  TEXT NOT NULL
);
"#;

pub const CREATE_HABIT_COMPLETIONS: &str = r#"
CREATE TABLE IF NOT EXISTS habit_completions (
  id             TEXT PRIMARY KEY,
  habit_id       TEXT NOT NULL REFERENCES habits(id) ON DELETE CASCADE,
  user_id        TEXT NOT NULL,
  completed_date TEXT NOT NULL,
  created_at     TEXT NOT NULL,
  UNIQUE (habit_id, completed_date)
);
"#;

pub const INDEX_HABITS_OWNER_CREATED_AT: &str =
    "CREATE INDEX IF NOT EXISTS idx_habits_user_created_at ON habits(user_id, created_at);";

pub const INDEX_COMPLETIONS_DATE: &str = "CREATE INDEX IF NOT EXISTS idx_habit_completions_date ON habit_completions(completed_date);";

pub const HABIT_COLUMNS: &str =
    "id, title, description, frequency, streak, color, user_id, created_at, updated_at";

pub const COMPLETION_COLUMNS: &str = "id, habit_id, user_id, completed_date, created_at";

pub fn schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_HABITS,
        CREATE_HABIT_COMPLETIONS,
        INDEX_HABITS_OWNER_CREATED_AT,
        INDEX_COMPLETIONS_DATE,
    ]
}

/// `?start, ?start+1, ...` placeholders for a set-membership filter.
pub fn numbered_placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::numbered_placeholders;

    #[test]
    fn placeholders_are_numbered_from_start() {
        assert_eq!(numbered_placeholders(2, 3), "?2, ?3, ?4");
        assert_eq!(numbered_placeholders(1, 0), "");
    }
}

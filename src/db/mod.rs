pub mod queries;

use crate::habits::model::{Frequency, Habit, HabitCompletion, HabitPatch, NewHabit};
use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDate, Utc};
use queries::{COMPLETION_COLUMNS, HABIT_COLUMNS};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANGE_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Habits,
    HabitCompletions,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Habits => "habits",
            Table::HabitCompletions => "habit_completions",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change published on the store's change feed after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableChange {
    pub table: Table,
    pub kind: ChangeKind,
    pub row_id: String,
}

/// Everything the habit service and board need from a persistent store.
///
/// Every read and write is scoped to an owner: habits and completions
/// belonging to another owner behave as if they did not exist. Completion
/// queries filter by exact match (`completions_on`) or by set membership
/// (`completed_habit_ids`).
pub trait HabitStore: Send + Sync {
    fn list_habits(&self, owner: &str) -> Result<Vec<Habit>>;

    fn habit(&self, owner: &str, id: &str) -> Result<Option<Habit>>;

    fn insert_habit(&self, owner: &str, habit: &NewHabit) -> Result<Habit>;

    fn update_habit(&self, owner: &str, id: &str, patch: &HabitPatch) -> Result<Option<Habit>>;

    fn delete_habit(&self, owner: &str, id: &str) -> Result<bool>;

    fn completions_on(
        &self,
        owner: &str,
        habit_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<HabitCompletion>>;

    fn completed_habit_ids(
        &self,
        owner: &str,
        habit_ids: &[String],
        date: NaiveDate,
    ) -> Result<Vec<String>>;

    /// Returns `None` when a completion for the same habit and date already
    /// exists, or when the habit is not the owner's.
    fn insert_completion(
        &self,
        owner: &str,
        habit_id: &str,
        date: NaiveDate,
    ) -> Result<Option<HabitCompletion>>;

    fn delete_completion(&self, owner: &str, id: &str) -> Result<bool>;

    fn completion_dates(&self, owner: &str, habit_id: &str) -> Result<Vec<NaiveDate>>;

    fn completions_between(
        &self,
        owner: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<HabitCompletion>>;

    fn subscribe(&self) -> broadcast::Receiver<TableChange>;
}

pub struct Database {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<TableChange>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create DB directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite DB: {}", path.display()))?;

        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite DB")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let database = Self {
            conn: Mutex::new(conn),
            changes,
        };
        database.init_schema()?;

        Ok(database)
    }

    pub fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(queries::ENABLE_FOREIGN_KEYS)
            .context("Failed to enable foreign keys")?;

        queries::schema_statements()
            .iter()
            .try_for_each(|statement| {
                conn.execute(statement, [])
                    .context("Failed to initialize schema")
                    .map(|_| ())
            })
    }

    /// Habits stored for `owner`, or for every owner when `owner` is `None`.
    pub fn habit_count(&self, owner: Option<&str>) -> Result<i64> {
        self.conn()?
            .query_row(
                "SELECT COUNT(*) FROM habits WHERE ?1 IS NULL OR user_id = ?1",
                params![owner],
                |row| row.get(0),
            )
            .context("Failed to count habits")
    }

    pub fn latest_completion_date(&self, owner: Option<&str>) -> Result<Option<NaiveDate>> {
        self.conn()?
            .query_row(
                "SELECT MAX(completed_date) FROM habit_completions WHERE ?1 IS NULL OR user_id = ?1",
                params![owner],
                |row| row.get(0),
            )
            .context("Failed to query latest completion")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("SQLite connection lock poisoned"))
    }

    fn publish(&self, table: Table, kind: ChangeKind, row_id: &str) {
        // No subscribers is not an error.
        let _ = self.changes.send(TableChange {
            table,
            kind,
            row_id: row_id.to_string(),
        });
    }
}

impl HabitStore for Database {
    fn list_habits(&self, owner: &str) -> Result<Vec<Habit>> {
        let conn = self.conn()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {HABIT_COLUMNS}
             FROM habits
             WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC"
        ))?;

        let rows = statement
            .query_map(params![owner], habit_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query habits")?;

        Ok(rows)
    }

    fn habit(&self, owner: &str, id: &str) -> Result<Option<Habit>> {
        self.conn()?
            .query_row(
                &format!("SELECT {HABIT_COLUMNS} FROM habits WHERE id = ?1 AND user_id = ?2"),
                params![id, owner],
                habit_from_row,
            )
            .optional()
            .context("Failed to query habit")
    }

    fn insert_habit(&self, owner: &str, habit: &NewHabit) -> Result<Habit> {
        let now = Utc::now();
        let created = Habit {
            id: Uuid::new_v4().to_string(),
            title: habit.title.clone(),
            description: habit.description.clone(),
            frequency: habit.frequency,
            streak: 0,
            color: habit.color.clone(),
            user_id: owner.to_string(),
            created_at: now,
            updated_at: now,
        };

        self.conn()?
            .execute(
                &format!("INSERT INTO habits ({HABIT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    &created.id,
                    &created.title,
                    &created.description,
                    created.frequency,
                    created.streak,
                    &created.color,
                    &created.user_id,
                    created.created_at,
                    created.updated_at
                ],
            )
            .context("Failed to insert habit")?;

        self.publish(Table::Habits, ChangeKind::Insert, &created.id);
        Ok(created)
    }

    fn update_habit(&self, owner: &str, id: &str, patch: &HabitPatch) -> Result<Option<Habit>> {
        let updated = {
            let mut conn = self.conn()?;
            let transaction = conn
                .transaction()
                .context("Failed to start transaction")?;

            let current = transaction
                .query_row(
                    &format!("SELECT {HABIT_COLUMNS} FROM habits WHERE id = ?1 AND user_id = ?2"),
                    params![id, owner],
                    habit_from_row,
                )
                .optional()
                .context("Failed to query habit for update")?;

            let Some(mut habit) = current else {
                return Ok(None);
            };

            patch.apply(&mut habit);
            habit.updated_at = Utc::now();

            transaction
                .execute(
                    "UPDATE habits
                     SET title = ?2, description = ?3, frequency = ?4, streak = ?5, color = ?6, updated_at = ?7
                     WHERE id = ?1",
                    params![
                        &habit.id,
                        &habit.title,
                        &habit.description,
                        habit.frequency,
                        habit.streak,
                        &habit.color,
                        habit.updated_at
                    ],
                )
                .context("Failed to update habit")?;

            transaction
                .commit()
                .context("Failed to commit habit update")?;
            habit
        };

        self.publish(Table::Habits, ChangeKind::Update, &updated.id);
        Ok(Some(updated))
    }

    fn delete_habit(&self, owner: &str, id: &str) -> Result<bool> {
        let deleted = self
            .conn()?
            .execute(
                "DELETE FROM habits WHERE id = ?1 AND user_id = ?2",
                params![id, owner],
            )
            .context("Failed to delete habit")?;

        if deleted > 0 {
            self.publish(Table::Habits, ChangeKind::Delete, id);
            // Completions went with the habit through ON DELETE CASCADE.
            self.publish(Table::HabitCompletions, ChangeKind::Delete, id);
        }

        Ok(deleted > 0)
    }

    fn completions_on(
        &self,
        owner: &str,
        habit_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<HabitCompletion>> {
        let conn = self.conn()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {COMPLETION_COLUMNS}
             FROM habit_completions
             WHERE user_id = ?1 AND habit_id = ?2 AND completed_date = ?3
             ORDER BY created_at ASC"
        ))?;

        let rows = statement
            .query_map(params![owner, habit_id, date], completion_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query habit completions")?;

        Ok(rows)
    }

    fn completed_habit_ids(
        &self,
        owner: &str,
        habit_ids: &[String],
        date: NaiveDate,
    ) -> Result<Vec<String>> {
        if habit_ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn()?;
        let mut statement = conn.prepare(&format!(
            "SELECT DISTINCT habit_id
             FROM habit_completions
             WHERE user_id = ?1 AND completed_date = ?2 AND habit_id IN ({})",
            queries::numbered_placeholders(3, habit_ids.len())
        ))?;

        let values = [&owner as &dyn ToSql, &date as &dyn ToSql]
            .into_iter()
            .chain(habit_ids.iter().map(|id| id as &dyn ToSql))
            .collect::<Vec<_>>();

        let rows = statement
            .query_map(values.as_slice(), |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to query completion status")?;

        Ok(rows)
    }

    fn insert_completion(
        &self,
        owner: &str,
        habit_id: &str,
        date: NaiveDate,
    ) -> Result<Option<HabitCompletion>> {
        let completion = HabitCompletion {
            id: Uuid::new_v4().to_string(),
            habit_id: habit_id.to_string(),
            user_id: owner.to_string(),
            completed_date: date,
            created_at: Utc::now(),
        };

        let inserted = self
            .conn()?
            .execute(
                &format!(
                    "INSERT INTO habit_completions ({COMPLETION_COLUMNS})
                     SELECT ?1, ?2, ?3, ?4, ?5
                     WHERE EXISTS (SELECT 1 FROM habits WHERE id = ?2 AND user_id = ?3)
                     ON CONFLICT(habit_id, completed_date) DO NOTHING"
                ),
                params![
                    &completion.id,
                    &completion.habit_id,
                    &completion.user_id,
                    completion.completed_date,
                    completion.created_at
                ],
            )
            .context("Failed to insert habit completion")?;

        if inserted == 0 {
            return Ok(None);
        }

        self.publish(Table::HabitCompletions, ChangeKind::Insert, &completion.id);
        Ok(Some(completion))
    }

    fn delete_completion(&self, owner: &str, id: &str) -> Result<bool> {
        let deleted = self
            .conn()?
            .execute(
                "DELETE FROM habit_completions WHERE id = ?1 AND user_id = ?2",
                params![id, owner],
            )
            .context("Failed to delete habit completion")?;

        if deleted > 0 {
            self.publish(Table::HabitCompletions, ChangeKind::Delete, id);
        }

        Ok(deleted > 0)
    }

    fn completion_dates(&self, owner: &str, habit_id: &str) -> Result<Vec<NaiveDate>> {
        let conn = self.conn()?;
        let mut statement = conn.prepare(
            "SELECT completed_date
             FROM habit_completions
             WHERE user_id = ?1 AND habit_id = ?2
             ORDER BY completed_date ASC",
        )?;

        let rows = statement
            .query_map(params![owner, habit_id], |row| row.get(0))?
            .collect::<Result<Vec<NaiveDate>, _>>()
            .context("Failed to query completion history")?;

        Ok(rows)
    }

    fn completions_between(
        &self,
        owner: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<HabitCompletion>> {
        let conn = self.conn()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {COMPLETION_COLUMNS}
             FROM habit_completions
             WHERE user_id = ?1 AND completed_date >= ?2 AND completed_date <= ?3
             ORDER BY completed_date ASC"
        ))?;

        let rows = statement
            .query_map(params![owner, from, to], completion_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query completions in range")?;

        Ok(rows)
    }

    fn subscribe(&self) -> broadcast::Receiver<TableChange> {
        self.changes.subscribe()
    }
}

impl ToSql for Frequency {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Frequency {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|error: anyhow::Error| FromSqlError::Other(error.into()))
    }
}

fn habit_from_row(row: &Row<'_>) -> rusqlite::Result<Habit> {
    Ok(Habit {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        frequency: row.get(3)?,
        streak: row.get(4)?,
        color: row.get(5)?,
        user_id: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn completion_from_row(row: &Row<'_>) -> rusqlite::Result<HabitCompletion> {
    Ok(HabitCompletion {
        id: row.get(0)?,
        habit_id: row.get(1)?,
        user_id: row.get(2)?,
        completed_date: row.get(3)?,
        created_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("valid date")
    }

    fn new_habit(title: &str) -> NewHabit {
        NewHabit::new(title, Frequency::Daily).normalized("blue")
    }

    #[test]
    fn open_creates_parent_directory_and_schema() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("habits.db");

        let database = Database::open(&path).expect("open database");
        assert!(path.exists());
        assert_eq!(database.habit_count(None).expect("count"), 0);

        // Reopening an initialized file keeps working.
        drop(database);
        Database::open(&path).expect("reopen database");
    }

    #[test]
    fn habits_are_listed_newest_first_per_owner() {
        let database = Database::open_in_memory().expect("database");
        database.insert_habit("u1", &new_habit("Read")).expect("insert");
        database.insert_habit("u1", &new_habit("Run")).expect("insert");
        database.insert_habit("u2", &new_habit("Swim")).expect("insert");

        let titles = database
            .list_habits("u1")
            .expect("list")
            .into_iter()
            .map(|habit| habit.title)
            .collect::<Vec<_>>();

        assert_eq!(titles, vec!["Run".to_string(), "Read".to_string()]);
    }

    #[test]
    fn other_owners_rows_are_invisible_to_updates_and_deletes() {
        let database = Database::open_in_memory().expect("database");
        let habit = database.insert_habit("u1", &new_habit("Read")).expect("insert");

        assert!(database.habit("u2", &habit.id).expect("get").is_none());
        assert!(
            database
                .update_habit("u2", &habit.id, &HabitPatch::streak(9))
                .expect("update")
                .is_none()
        );
        assert!(!database.delete_habit("u2", &habit.id).expect("delete"));
    }

    #[test]
    fn update_applies_patch_and_bumps_updated_at() {
        let database = Database::open_in_memory().expect("database");
        let habit = database.insert_habit("u1", &new_habit("Read")).expect("insert");

        let patch = HabitPatch {
            title: Some("Read more".to_string()),
            frequency: Some(Frequency::Weekly),
            ..HabitPatch::default()
        };
        let updated = database
            .update_habit("u1", &habit.id, &patch)
            .expect("update")
            .expect("row exists");

        assert_eq!(updated.title, "Read more");
        assert_eq!(updated.frequency, Frequency::Weekly);
        assert!(updated.updated_at >= habit.updated_at);
        assert_eq!(database.habit("u1", &habit.id).expect("get"), Some(updated));
    }

    #[test]
    fn second_completion_on_same_day_is_a_no_op() {
        let database = Database::open_in_memory().expect("database");
        let habit = database.insert_habit("u1", &new_habit("Read")).expect("insert");
        let today = date("2026-03-10");

        assert!(
            database
                .insert_completion("u1", &habit.id, today)
                .expect("insert")
                .is_some()
        );
        assert!(
            database
                .insert_completion("u1", &habit.id, today)
                .expect("insert")
                .is_none()
        );
        assert_eq!(
            database
                .completions_on("u1", &habit.id, today)
                .expect("query")
                .len(),
            1
        );
    }

    #[test]
    fn completed_habit_ids_filters_by_set_and_date() {
        let database = Database::open_in_memory().expect("database");
        let read = database.insert_habit("u1", &new_habit("Read")).expect("insert");
        let run = database.insert_habit("u1", &new_habit("Run")).expect("insert");
        let swim = database.insert_habit("u1", &new_habit("Swim")).expect("insert");
        let today = date("2026-03-10");

        database.insert_completion("u1", &read.id, today).expect("insert");
        database
            .insert_completion("u1", &run.id, date("2026-03-09"))
            .expect("insert");
        database.insert_completion("u1", &swim.id, today).expect("insert");

        let ids = database
            .completed_habit_ids("u1", &[read.id.clone(), run.id.clone()], today)
            .expect("query");
        assert_eq!(ids, vec![read.id.clone()]);
        assert!(
            database
                .completed_habit_ids("u1", &[], today)
                .expect("query")
                .is_empty()
        );
        assert!(
            database
                .completed_habit_ids("u2", &[read.id], today)
                .expect("query")
                .is_empty()
        );
    }

    #[test]
    fn deleting_a_habit_cascades_to_completions() {
        let database = Database::open_in_memory().expect("database");
        let habit = database.insert_habit("u1", &new_habit("Read")).expect("insert");
        database
            .insert_completion("u1", &habit.id, date("2026-03-09"))
            .expect("insert");
        database
            .insert_completion("u1", &habit.id, date("2026-03-10"))
            .expect("insert");

        assert!(database.delete_habit("u1", &habit.id).expect("delete"));
        assert!(
            database
                .completion_dates("u1", &habit.id)
                .expect("history")
                .is_empty()
        );
    }

    #[test]
    fn completion_for_unknown_or_foreign_habit_is_not_recorded() {
        let database = Database::open_in_memory().expect("database");
        let theirs = database.insert_habit("u2", &new_habit("Run")).expect("insert");
        let today = date("2026-03-10");

        assert_eq!(
            database
                .insert_completion("u1", "missing", today)
                .expect("insert"),
            None
        );
        assert_eq!(
            database
                .insert_completion("u1", &theirs.id, today)
                .expect("insert"),
            None
        );
        assert!(
            database
                .completion_dates("u2", &theirs.id)
                .expect("history")
                .is_empty()
        );
    }

    #[test]
    fn completions_of_another_owner_are_invisible() {
        let database = Database::open_in_memory().expect("database");
        let theirs = database.insert_habit("u2", &new_habit("Run")).expect("insert");
        let today = date("2026-03-10");
        let completion = database
            .insert_completion("u2", &theirs.id, today)
            .expect("insert")
            .expect("inserted");

        assert!(
            database
                .completions_on("u1", &theirs.id, today)
                .expect("query")
                .is_empty()
        );
        assert!(
            database
                .completion_dates("u1", &theirs.id)
                .expect("history")
                .is_empty()
        );
        assert!(!database.delete_completion("u1", &completion.id).expect("delete"));
        assert_eq!(
            database.completion_dates("u2", &theirs.id).expect("history"),
            vec![today]
        );
        assert_eq!(database.habit_count(Some("u1")).expect("count"), 0);
        assert_eq!(database.habit_count(Some("u2")).expect("count"), 1);
        assert_eq!(database.latest_completion_date(Some("u1")).expect("latest"), None);
    }

    #[test]
    fn change_feed_reports_each_table() {
        let database = Database::open_in_memory().expect("database");
        let mut receiver = database.subscribe();

        let habit = database.insert_habit("u1", &new_habit("Read")).expect("insert");
        let completion = database
            .insert_completion("u1", &habit.id, date("2026-03-10"))
            .expect("insert")
            .expect("inserted");
        database.delete_completion("u1", &completion.id).expect("delete");

        let first = receiver.try_recv().expect("habit insert");
        assert_eq!(first.table, Table::Habits);
        assert_eq!(first.kind, ChangeKind::Insert);
        assert_eq!(first.row_id, habit.id);

        let second = receiver.try_recv().expect("completion insert");
        assert_eq!(second.table, Table::HabitCompletions);
        assert_eq!(second.kind, ChangeKind::Insert);

        let third = receiver.try_recv().expect("completion delete");
        assert_eq!(third.kind, ChangeKind::Delete);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn range_query_is_inclusive_and_owner_scoped() {
        let database = Database::open_in_memory().expect("database");
        let mine = database.insert_habit("u1", &new_habit("Read")).expect("insert");
        let theirs = database.insert_habit("u2", &new_habit("Run")).expect("insert");

        for raw in ["2026-03-01", "2026-03-05", "2026-03-08"] {
            database.insert_completion("u1", &mine.id, date(raw)).expect("insert");
        }
        database
            .insert_completion("u2", &theirs.id, date("2026-03-05"))
            .expect("insert");

        let completions = database
            .completions_between("u1", date("2026-03-01"), date("2026-03-05"))
            .expect("range");
        assert_eq!(completions.len(), 2);
        assert!(completions.iter().all(|completion| completion.user_id == "u1"));
        assert_eq!(
            database.latest_completion_date(None).expect("latest"),
            Some(date("2026-03-08"))
        );
        assert_eq!(
            database.latest_completion_date(Some("u2")).expect("latest"),
            Some(date("2026-03-05"))
        );
    }
}

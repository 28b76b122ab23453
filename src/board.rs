use crate::db::{HabitStore, Table, TableChange};
use crate::habits::model::{Frequency, Habit, HabitPatch, NewHabit};
use crate::habits::service::HabitService;
use anyhow::{Result, bail};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FrequencyFilter {
    #[default]
    All,
    Only(Frequency),
}

impl FrequencyFilter {
    pub fn matches(self, habit: &Habit) -> bool {
        match self {
            FrequencyFilter::All => true,
            FrequencyFilter::Only(frequency) => habit.frequency == frequency,
        }
    }
}

impl FromStr for FrequencyFilter {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" | "all" => Ok(FrequencyFilter::All),
            other => Ok(FrequencyFilter::Only(other.parse()?)),
        }
    }
}

impl fmt::Display for FrequencyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrequencyFilter::All => f.write_str("all"),
            FrequencyFilter::Only(frequency) => write!(f, "{frequency}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusFilter {
    #[default]
    All,
    Completed,
    Pending,
}

impl StatusFilter {
    pub const ALL: [StatusFilter; 3] = [
        StatusFilter::All,
        StatusFilter::Completed,
        StatusFilter::Pending,
    ];

    pub fn matches(self, completed: bool) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Completed => completed,
            StatusFilter::Pending => !completed,
        }
    }
}

impl FromStr for StatusFilter {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" | "all" => Ok(StatusFilter::All),
            "completed" | "done" => Ok(StatusFilter::Completed),
            "pending" | "open" => Ok(StatusFilter::Pending),
            _ => bail!("Unsupported status filter: {raw}. Expected all|completed|pending"),
        }
    }
}

impl fmt::Display for StatusFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusFilter::All => f.write_str("all"),
            StatusFilter::Completed => f.write_str("completed"),
            StatusFilter::Pending => f.write_str("pending"),
        }
    }
}

/// Habits passing both filters, in their original order. A habit missing
/// from `status` counts as pending.
pub fn filter_habits(
    habits: &[Habit],
    status: &HashMap<String, bool>,
    frequency: FrequencyFilter,
    completion: StatusFilter,
) -> Vec<Habit> {
    habits
        .iter()
        .filter(|habit| frequency.matches(habit))
        .filter(|habit| completion.matches(status.get(&habit.id).copied().unwrap_or(false)))
        .cloned()
        .collect()
}

/// Client-side cache of the signed-in user's habits with derived views.
pub struct HabitBoard<S: ?Sized> {
    service: HabitService<S>,
    habits: Vec<Habit>,
    completion_status: HashMap<String, bool>,
    frequency_filter: FrequencyFilter,
    status_filter: StatusFilter,
    filtered: Vec<Habit>,
}

impl<S: HabitStore + ?Sized> HabitBoard<S> {
    pub fn new(service: HabitService<S>) -> Self {
        Self {
            service,
            habits: Vec::new(),
            completion_status: HashMap::new(),
            frequency_filter: FrequencyFilter::default(),
            status_filter: StatusFilter::default(),
            filtered: Vec::new(),
        }
    }

    pub fn habits(&self) -> &[Habit] {
        &self.habits
    }

    pub fn filtered_habits(&self) -> &[Habit] {
        &self.filtered
    }

    pub fn completion_status(&self) -> &HashMap<String, bool> {
        &self.completion_status
    }

    pub fn is_completed(&self, habit_id: &str) -> bool {
        self.completion_status
            .get(habit_id)
            .copied()
            .unwrap_or(false)
    }

    pub fn frequency_filter(&self) -> FrequencyFilter {
        self.frequency_filter
    }

    pub fn status_filter(&self) -> StatusFilter {
        self.status_filter
    }

    pub fn service(&self) -> &HabitService<S> {
        &self.service
    }

    pub fn set_frequency_filter(&mut self, filter: FrequencyFilter) {
        self.frequency_filter = filter;
        self.apply_filters();
    }

    pub fn set_status_filter(&mut self, filter: StatusFilter) {
        self.status_filter = filter;
        self.apply_filters();
    }

    /// Refetches the habit list, then the completion status of every habit in
    /// one batched query.
    pub fn refresh(&mut self) {
        self.habits = self.service.fetch_habits();
        debug!(count = self.habits.len(), "habit list refreshed");
        self.refresh_status();
    }

    /// Recomputes completion status for the cached list without refetching it.
    pub fn refresh_status(&mut self) {
        let ids = self
            .habits
            .iter()
            .map(|habit| habit.id.clone())
            .collect::<Vec<_>>();
        self.completion_status = self.service.check_habit_completion_status(&ids);
        self.apply_filters();
    }

    pub fn create_habit(&mut self, input: &NewHabit) -> Option<Habit> {
        let created = self.service.create_habit(input)?;
        self.refresh();
        Some(created)
    }

    pub fn update_habit(&mut self, id: &str, patch: &HabitPatch) -> Option<Habit> {
        let updated = self.service.update_habit(id, patch)?;
        self.refresh();
        Some(updated)
    }

    pub fn delete_habit(&mut self, id: &str) -> bool {
        let deleted = self.service.delete_habit(id);
        if deleted {
            self.refresh();
        }
        deleted
    }

    pub fn toggle_completion(&mut self, habit: &Habit) -> bool {
        let toggled = self.service.toggle_habit_completion(habit);
        if toggled {
            self.refresh_status();
        }
        toggled
    }

    /// Reacts to a change on the store's feed.
    pub fn apply_change(&mut self, change: &TableChange) {
        debug!(table = change.table.as_str(), row = %change.row_id, "store change");
        match change.table {
            Table::Habits => self.refresh(),
            Table::HabitCompletions => self.refresh_status(),
        }
    }

    pub fn subscribe(&self) -> BoardSubscription {
        BoardSubscription::new(self.service.store().subscribe())
    }

    /// Applies changes from `subscription` until the feed closes or the
    /// subscription is torn down, calling `on_update` after each one.
    pub async fn watch<F>(&mut self, subscription: &mut BoardSubscription, mut on_update: F)
    where
        F: FnMut(&Self),
    {
        while let Some(event) = subscription.next().await {
            match event {
                FeedEvent::Change(change) => self.apply_change(&change),
                FeedEvent::Resync => self.refresh(),
            }
            on_update(self);
        }
    }

    fn apply_filters(&mut self) {
        self.filtered = filter_habits(
            &self.habits,
            &self.completion_status,
            self.frequency_filter,
            self.status_filter,
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Change(TableChange),
    /// Changes were missed; everything must be refetched.
    Resync,
}

/// Subscription to the store's change feed, owned by one board consumer.
///
/// Teardown happens exactly once: on the first `unsubscribe` call, or on drop
/// if `unsubscribe` was never called.
pub struct BoardSubscription {
    receiver: Option<broadcast::Receiver<TableChange>>,
}

impl BoardSubscription {
    pub fn new(receiver: broadcast::Receiver<TableChange>) -> Self {
        Self {
            receiver: Some(receiver),
        }
    }

    pub fn is_active(&self) -> bool {
        self.receiver.is_some()
    }

    /// Next event, or `None` once the feed is closed or torn down.
    pub async fn next(&mut self) -> Option<FeedEvent> {
        let receiver = self.receiver.as_mut()?;
        match receiver.recv().await {
            Ok(change) => Some(FeedEvent::Change(change)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "change feed lagged, resyncing");
                Some(FeedEvent::Resync)
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.unsubscribe();
                None
            }
        }
    }

    /// Returns `true` only for the call that actually tore the subscription down.
    pub fn unsubscribe(&mut self) -> bool {
        match self.receiver.take() {
            Some(receiver) => {
                drop(receiver);
                info!("change feed subscription closed");
                true
            }
            None => false,
        }
    }
}

impl Drop for BoardSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{RequestSession, SessionSource};
    use crate::db::{ChangeKind, Database};
    use crate::notify::Notifier;
    use chrono::{NaiveDate, Utc};
    use std::sync::Arc;

    fn today() -> NaiveDate {
        NaiveDate::parse_from_str("2026-03-10", "%Y-%m-%d").expect("valid date")
    }

    fn board() -> HabitBoard<Database> {
        let session: Arc<dyn SessionSource> = Arc::new(RequestSession::user("U"));
        let service = HabitService::new(
            Arc::new(Database::open_in_memory().expect("database")),
            session,
            Notifier::new(),
        )
        .pinned_to(today());
        HabitBoard::new(service)
    }

    fn sample(id: &str, frequency: Frequency) -> Habit {
        let now = Utc::now();
        Habit {
            id: id.to_string(),
            title: id.to_string(),
            description: None,
            frequency,
            streak: 0,
            color: None,
            user_id: "U".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn filtering_law_holds_for_every_combination() {
        let habits = vec![
            sample("d1", Frequency::Daily),
            sample("d2", Frequency::Daily),
            sample("w1", Frequency::Weekly),
            sample("m1", Frequency::Monthly),
        ];
        // m1 is absent from the map on purpose.
        let status = HashMap::from([
            ("d1".to_string(), true),
            ("d2".to_string(), false),
            ("w1".to_string(), true),
        ]);

        let frequencies = std::iter::once(FrequencyFilter::All)
            .chain(Frequency::ALL.into_iter().map(FrequencyFilter::Only))
            .collect::<Vec<_>>();

        for frequency in frequencies {
            for completion in StatusFilter::ALL {
                let expected = habits
                    .iter()
                    .filter(|habit| match frequency {
                        FrequencyFilter::All => true,
                        FrequencyFilter::Only(value) => habit.frequency == value,
                    })
                    .filter(|habit| {
                        let done = status.get(&habit.id).copied().unwrap_or(false);
                        match completion {
                            StatusFilter::All => true,
                            StatusFilter::Completed => done,
                            StatusFilter::Pending => !done,
                        }
                    })
                    .map(|habit| habit.id.clone())
                    .collect::<Vec<_>>();

                let actual = filter_habits(&habits, &status, frequency, completion)
                    .into_iter()
                    .map(|habit| habit.id)
                    .collect::<Vec<_>>();

                assert_eq!(actual, expected, "frequency={frequency} status={completion}");
            }
        }
    }

    #[test]
    fn filters_parse_from_strings() {
        assert_eq!("all".parse::<FrequencyFilter>().unwrap(), FrequencyFilter::All);
        assert_eq!(
            "weekly".parse::<FrequencyFilter>().unwrap(),
            FrequencyFilter::Only(Frequency::Weekly)
        );
        assert_eq!("pending".parse::<StatusFilter>().unwrap(), StatusFilter::Pending);
        assert!("later".parse::<StatusFilter>().is_err());
    }

    #[test]
    fn mutations_keep_the_cache_current() {
        let mut board = board();
        board.refresh();
        assert!(board.habits().is_empty());

        let read = board
            .create_habit(&NewHabit::new("Read", Frequency::Daily))
            .expect("created");
        board
            .create_habit(&NewHabit::new("Review", Frequency::Weekly))
            .expect("created");
        assert_eq!(board.habits().len(), 2);

        assert!(board.toggle_completion(&read));
        assert!(board.is_completed(&read.id));

        board.set_status_filter(StatusFilter::Completed);
        assert_eq!(board.filtered_habits().len(), 1);
        assert_eq!(board.filtered_habits()[0].id, read.id);

        board.set_status_filter(StatusFilter::All);
        board.set_frequency_filter(FrequencyFilter::Only(Frequency::Weekly));
        assert_eq!(board.filtered_habits()[0].title, "Review");

        assert!(board.delete_habit(&read.id));
        assert_eq!(board.habits().len(), 1);
        assert!(board.filtered_habits().iter().all(|habit| habit.id != read.id));
    }

    #[test]
    fn remote_changes_refresh_the_right_state() {
        let mut board = board();
        board.refresh();

        // Another client writes directly to the shared store.
        let store = Arc::clone(board.service().store());
        let habit = store
            .insert_habit("U", &NewHabit::new("Read", Frequency::Daily).normalized("blue"))
            .expect("insert");
        board.apply_change(&TableChange {
            table: Table::Habits,
            kind: ChangeKind::Insert,
            row_id: habit.id.clone(),
        });
        assert_eq!(board.habits().len(), 1);
        assert!(!board.is_completed(&habit.id));

        store
            .insert_completion("U", &habit.id, today())
            .expect("insert");
        board.apply_change(&TableChange {
            table: Table::HabitCompletions,
            kind: ChangeKind::Insert,
            row_id: habit.id.clone(),
        });
        assert!(board.is_completed(&habit.id));
    }

    #[test]
    fn subscription_tears_down_exactly_once() {
        let (sender, receiver) = broadcast::channel::<TableChange>(4);
        let mut subscription = BoardSubscription::new(receiver);
        assert_eq!(sender.receiver_count(), 1);

        assert!(subscription.unsubscribe());
        assert!(!subscription.unsubscribe());
        assert!(!subscription.is_active());
        assert_eq!(sender.receiver_count(), 0);
        drop(subscription);
    }

    #[test]
    fn dropping_a_subscription_releases_the_receiver() {
        let (sender, receiver) = broadcast::channel::<TableChange>(4);
        let subscription = BoardSubscription::new(receiver);
        drop(subscription);
        assert_eq!(sender.receiver_count(), 0);
    }

    #[tokio::test]
    async fn subscription_delivers_store_changes() {
        let board = board();
        let mut subscription = board.subscribe();

        let store = Arc::clone(board.service().store());
        let habit = store
            .insert_habit("U", &NewHabit::new("Read", Frequency::Daily).normalized("blue"))
            .expect("insert");

        assert_eq!(
            subscription.next().await,
            Some(FeedEvent::Change(TableChange {
                table: Table::Habits,
                kind: ChangeKind::Insert,
                row_id: habit.id,
            }))
        );
        assert!(subscription.unsubscribe());
        assert_eq!(subscription.next().await, None);
    }

    #[tokio::test]
    async fn watch_applies_changes_until_the_feed_closes() {
        let mut board = board();
        board.refresh();

        let (sender, receiver) = broadcast::channel::<TableChange>(4);
        let mut subscription = BoardSubscription::new(receiver);

        let store = Arc::clone(board.service().store());
        let habit = store
            .insert_habit("U", &NewHabit::new("Read", Frequency::Daily).normalized("blue"))
            .expect("insert");
        sender
            .send(TableChange {
                table: Table::Habits,
                kind: ChangeKind::Insert,
                row_id: habit.id.clone(),
            })
            .expect("send");
        drop(sender);

        let mut seen = Vec::new();
        board
            .watch(&mut subscription, |board| seen.push(board.habits().len()))
            .await;

        assert_eq!(seen, vec![1]);
        assert!(!subscription.is_active());
    }

    #[tokio::test]
    async fn lagged_feed_requests_a_resync() {
        let (sender, receiver) = broadcast::channel::<TableChange>(1);
        let mut subscription = BoardSubscription::new(receiver);

        for row in ["a", "b"] {
            sender
                .send(TableChange {
                    table: Table::HabitCompletions,
                    kind: ChangeKind::Insert,
                    row_id: row.to_string(),
                })
                .expect("send");
        }

        assert_eq!(subscription.next().await, Some(FeedEvent::Resync));
    }
}

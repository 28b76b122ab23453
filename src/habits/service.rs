use crate::auth::SessionSource;
use crate::config::StreakPolicy;
use crate::db::HabitStore;
use crate::habits::model::{DEFAULT_COLOR, Habit, HabitPatch, NewHabit};
use crate::habits::streak;
use crate::notify::{Notice, NoticeAction, Notifier};
use crate::stats::{self, StatisticsReport, Timeframe};
use anyhow::Result;
use chrono::{Local, NaiveDate};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Domain operations over a [`HabitStore`].
///
/// Every operation absorbs its failures: the error is logged, surfaced as an
/// error notice, and the caller receives an empty list, `None` or `false`.
pub struct HabitService<S: ?Sized> {
    store: Arc<S>,
    session: Arc<dyn SessionSource>,
    notifier: Notifier,
    streak_policy: StreakPolicy,
    default_color: String,
    pinned_today: Option<NaiveDate>,
}

impl<S: ?Sized> Clone for HabitService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            session: Arc::clone(&self.session),
            notifier: self.notifier.clone(),
            streak_policy: self.streak_policy,
            default_color: self.default_color.clone(),
            pinned_today: self.pinned_today,
        }
    }
}

impl<S: HabitStore + ?Sized> HabitService<S> {
    pub fn new(store: Arc<S>, session: Arc<dyn SessionSource>, notifier: Notifier) -> Self {
        Self {
            store,
            session,
            notifier,
            streak_policy: StreakPolicy::default(),
            default_color: DEFAULT_COLOR.to_string(),
            pinned_today: None,
        }
    }

    pub fn with_streak_policy(mut self, policy: StreakPolicy) -> Self {
        self.streak_policy = policy;
        self
    }

    pub fn with_default_color(mut self, color: &str) -> Self {
        self.default_color = color.to_string();
        self
    }

    /// Fixes "today" instead of reading the local clock.
    pub fn pinned_to(mut self, today: NaiveDate) -> Self {
        self.pinned_today = Some(today);
        self
    }

    pub fn today(&self) -> NaiveDate {
        self.pinned_today
            .unwrap_or_else(|| Local::now().date_naive())
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn current_user(&self) -> Option<String> {
        self.session.current_user()
    }

    /// Habits of the signed-in user, newest first.
    pub fn fetch_habits(&self) -> Vec<Habit> {
        let Some(owner) = self.session.current_user() else {
            debug!("no session, no visible habits");
            return Vec::new();
        };

        self.absorb(self.store.list_habits(&owner), "Could not load your habits")
            .unwrap_or_default()
    }

    pub fn find_habit(&self, id: &str) -> Option<Habit> {
        let owner = self.require_owner("You must be signed in to view a habit")?;

        match self.absorb(self.store.habit(&owner, id), "Could not load the habit")? {
            Some(habit) => Some(habit),
            None => {
                self.reject("Habit not found", format!("No habit with id {id}"));
                None
            }
        }
    }

    pub fn create_habit(&self, input: &NewHabit) -> Option<Habit> {
        let owner = self.require_owner("You must be signed in to create a habit")?;
        self.absorb(input.validate(), "Could not create the habit")?;

        let habit = self.absorb(
            self.store
                .insert_habit(&owner, &input.normalized(&self.default_color)),
            "Could not create the habit",
        )?;

        info!(habit = %habit.id, user = %owner, "habit created");
        self.notifier.success("Habit created");
        Some(habit)
    }

    pub fn update_habit(&self, id: &str, patch: &HabitPatch) -> Option<Habit> {
        let owner = self.require_owner("You must be signed in to update a habit")?;
        self.absorb(patch.validate(), "Could not update the habit")?;

        match self.absorb(
            self.store.update_habit(&owner, id, patch),
            "Could not update the habit",
        )? {
            Some(habit) => {
                self.notifier.success("Habit updated");
                Some(habit)
            }
            None => {
                self.reject("Could not update the habit", format!("No habit with id {id}"));
                None
            }
        }
    }

    pub fn delete_habit(&self, id: &str) -> bool {
        let Some(owner) = self.require_owner("You must be signed in to delete a habit") else {
            return false;
        };

        match self.absorb(
            self.store.delete_habit(&owner, id),
            "Could not delete the habit",
        ) {
            Some(true) => {
                info!(habit = %id, "habit deleted");
                self.notifier.success("Habit deleted");
                true
            }
            Some(false) => {
                self.reject("Could not delete the habit", format!("No habit with id {id}"));
                false
            }
            None => false,
        }
    }

    /// Flips today's completion for `habit` and adjusts its streak. The new
    /// streak is not returned; re-fetch the habit to observe it.
    pub fn toggle_habit_completion(&self, habit: &Habit) -> bool {
        let today = self.today();

        let Some(owner) = self.require_owner("You must be signed in to update a habit") else {
            return false;
        };

        let Some(existing) = self.absorb(
            self.store.completions_on(&owner, &habit.id, today),
            "Could not check the habit status",
        ) else {
            return false;
        };

        // Streak arithmetic starts from the stored row, not the caller's copy.
        let current = match self.absorb(
            self.store.habit(&owner, &habit.id),
            "Could not check the habit status",
        ) {
            Some(Some(current)) => current,
            Some(None) => {
                self.reject("Habit not found", format!("No habit with id {}", habit.id));
                return false;
            }
            None => return false,
        };

        let undo = NoticeAction::UndoToggle {
            habit_id: habit.id.clone(),
        };

        if let Some(completion) = existing.first() {
            if self
                .absorb(
                    self.store.delete_completion(&owner, &completion.id),
                    "Could not mark the habit as not completed",
                )
                .is_none()
            {
                return false;
            }

            let next = match self.streak_policy {
                StreakPolicy::Counter => current.streak.checked_sub(1),
                StreakPolicy::History => self.recomputed_streak(&owner, &current),
            };
            self.persist_streak(&owner, &current, next);

            self.notifier
                .push(Notice::success("Habit marked as not completed").with_action(undo));
            return true;
        }

        let inserted = match self.absorb(
            self.store.insert_completion(&owner, &habit.id, today),
            "Could not mark the habit as completed",
        ) {
            Some(inserted) => inserted,
            None => return false,
        };

        if inserted.is_none() {
            info!(habit = %habit.id, date = %today, "completion already recorded");
            return true;
        }

        let next = match self.streak_policy {
            StreakPolicy::Counter => Some(current.streak.saturating_add(1)),
            StreakPolicy::History => self.recomputed_streak(&owner, &current),
        };
        self.persist_streak(&owner, &current, next);

        self.notifier
            .push(Notice::success("Habit completed").with_action(undo));
        true
    }

    /// Whether each habit has a completion for today; unknown ids map to `false`.
    pub fn check_habit_completion_status(&self, habit_ids: &[String]) -> HashMap<String, bool> {
        if habit_ids.is_empty() {
            return HashMap::new();
        }
        let Some(owner) = self.session.current_user() else {
            debug!("no session, no completion status");
            return HashMap::new();
        };

        let Some(completed) = self.absorb(
            self.store
                .completed_habit_ids(&owner, habit_ids, self.today()),
            "Could not check habit statuses",
        ) else {
            return HashMap::new();
        };

        let mut status = habit_ids
            .iter()
            .map(|id| (id.clone(), false))
            .collect::<HashMap<_, _>>();
        completed.into_iter().for_each(|id| {
            status.insert(id, true);
        });

        status
    }

    pub fn completion_history(&self, habit_id: &str) -> Vec<NaiveDate> {
        let Some(owner) = self.session.current_user() else {
            debug!("no session, no completion history");
            return Vec::new();
        };

        self.absorb(
            self.store.completion_dates(&owner, habit_id),
            "Could not load the completion history",
        )
        .unwrap_or_default()
    }

    /// Rewrites every stored streak that disagrees with the completion history.
    /// Returns how many habits were corrected.
    pub fn reconcile_streaks(&self) -> usize {
        let Some(owner) = self.require_owner("You must be signed in to reconcile streaks") else {
            return 0;
        };
        let Some(habits) = self.absorb(self.store.list_habits(&owner), "Could not load your habits")
        else {
            return 0;
        };

        let corrected = habits
            .iter()
            .filter_map(|habit| {
                let expected = self.recomputed_streak(&owner, habit)?;
                (expected != habit.streak).then_some((habit, expected))
            })
            .filter(|(habit, expected)| {
                self.absorb(
                    self.store
                        .update_habit(&owner, &habit.id, &HabitPatch::streak(*expected)),
                    "Could not update the streak",
                )
                .flatten()
                .is_some()
            })
            .inspect(|(habit, expected)| {
                info!(habit = %habit.id, from = habit.streak, to = expected, "streak reconciled");
            })
            .count();

        self.notifier
            .success(format!("{corrected} streak(s) reconciled"));
        corrected
    }

    pub fn statistics(&self, timeframe: Timeframe) -> Option<StatisticsReport> {
        let owner = self.require_owner("You must be signed in to view statistics")?;
        let today = self.today();

        let habits = self.absorb(self.store.list_habits(&owner), "Could not load your habits")?;
        let ids = habits.iter().map(|habit| habit.id.clone()).collect::<Vec<_>>();
        let status = self.check_habit_completion_status(&ids);
        let completions = self.absorb(
            self.store
                .completions_between(&owner, timeframe.start(today), today),
            "Could not load completions",
        )?;
        let histories = habits
            .iter()
            .map(|habit| (habit.id.clone(), self.completion_history(&habit.id)))
            .collect::<HashMap<_, _>>();

        Some(stats::build_report(
            timeframe,
            today,
            &habits,
            &status,
            &completions,
            &histories,
        ))
    }

    fn recomputed_streak(&self, owner: &str, habit: &Habit) -> Option<u32> {
        let dates = self.absorb(
            self.store.completion_dates(owner, &habit.id),
            "Could not load the completion history",
        )?;
        Some(streak::current_streak(habit.frequency, &dates, self.today()))
    }

    fn persist_streak(&self, owner: &str, habit: &Habit, next: Option<u32>) {
        let Some(next) = next.filter(|value| *value != habit.streak) else {
            return;
        };

        if let Err(error) = self
            .store
            .update_habit(owner, &habit.id, &HabitPatch::streak(next))
        {
            warn!(error = %error, habit = %habit.id, "failed to persist streak");
            self.notifier
                .error("Could not update the streak", Some(error.to_string()));
        }
    }

    fn require_owner(&self, message: &str) -> Option<String> {
        let owner = self.session.current_user();
        if owner.is_none() {
            error!("no authenticated user");
            self.notifier.error(message, None);
        }
        owner
    }

    fn reject(&self, message: &str, description: String) {
        warn!(reason = %description, "{message}");
        self.notifier.error(message, Some(description));
    }

    fn absorb<T>(&self, result: Result<T>, message: &str) -> Option<T> {
        result
            .map_err(|error| {
                error!(error = %error, "{message}");
                self.notifier.error(message, Some(error.to_string()));
            })
            .ok()
    }
}

use crate::auth::{Auth, RequestSession};
use crate::board::{FrequencyFilter, HabitBoard, StatusFilter};
use crate::config::Config;
use crate::db::Database;
use crate::habits::model::{Habit, HabitPatch, NewHabit};
use crate::habits::service::HabitService;
use crate::habits::streak;
use crate::notify::{self, Notice, Notifier};
use crate::stats::{StatisticsReport, Timeframe};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

pub const USER_HEADER: &str = "x-habitory-user";

#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<Config>,
    pub store: Arc<Database>,
    pub auth: Arc<Auth>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/status", get(status))
        .route("/api/v1/habits", get(list_habits).post(create_habit))
        .route(
            "/api/v1/habits/:id",
            get(get_habit).patch(update_habit).delete(delete_habit),
        )
        .route("/api/v1/habits/:id/toggle", post(toggle_habit))
        .route("/api/v1/habits/:id/history", get(habit_history))
        .route("/api/v1/completion-status", get(completion_status))
        .route("/api/v1/stats", get(statistics))
        .route("/api/v1/streaks/reconcile", post(reconcile_streaks))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct HabitsQuery {
    frequency: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusQuery {
    ids: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StatsQuery {
    timeframe: Option<String>,
}

#[derive(Debug, Serialize)]
struct Envelope<T> {
    data: T,
    notices: Vec<Notice>,
}

#[derive(Debug, Serialize)]
struct StatusPayload {
    api_port: u16,
    db_path: PathBuf,
    habit_count: i64,
    latest_completion: Option<NaiveDate>,
    signed_in_user: Option<String>,
}

#[derive(Debug, Serialize)]
struct HabitListPayload {
    frequency: String,
    status: String,
    total: usize,
    habits: Vec<Habit>,
    completion_status: HashMap<String, bool>,
}

#[derive(Debug, Serialize)]
struct TogglePayload {
    habit_id: String,
    completed_today: bool,
    habit: Option<Habit>,
}

#[derive(Debug, Serialize)]
struct HistoryPayload {
    habit_id: String,
    dates: Vec<NaiveDate>,
    current_streak: u32,
    longest_streak: u32,
}

/// A service bound to the caller of one request, plus the notices it raises.
struct RequestScope {
    service: HabitService<Database>,
    notices: broadcast::Receiver<Notice>,
}

impl RequestScope {
    fn new(state: &ApiState, headers: &HeaderMap) -> Self {
        let header_user = headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok());
        let session = RequestSession::new(header_user, state.auth.as_ref());

        let notifier = Notifier::new();
        let notices = notifier.subscribe();
        let service = HabitService::new(Arc::clone(&state.store), Arc::new(session), notifier)
            .with_streak_policy(state.config.streak_policy)
            .with_default_color(&state.config.default_color);

        Self { service, notices }
    }

    fn respond<T>(mut self, data: T) -> Json<Envelope<T>> {
        Json(Envelope {
            data,
            notices: notify::drain(&mut self.notices),
        })
    }

    fn reject(mut self, status: StatusCode) -> ApiError {
        ApiError::Rejected(status, notify::drain(&mut self.notices))
    }
}

async fn status(State(state): State<ApiState>, headers: HeaderMap) -> ApiResult<Json<StatusPayload>> {
    let scope = RequestScope::new(&state, &headers);
    let caller = scope.service.current_user();

    // Counts only ever cover the caller's own rows.
    let (habit_count, latest_completion) = match caller.as_deref() {
        Some(owner) => (
            state.store.habit_count(Some(owner))?,
            state.store.latest_completion_date(Some(owner))?,
        ),
        None => (0, None),
    };

    Ok(Json(StatusPayload {
        api_port: state.config.api_port,
        db_path: state.config.db_path.clone(),
        habit_count,
        latest_completion,
        signed_in_user: caller,
    }))
}

async fn list_habits(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<HabitsQuery>,
) -> ApiResult<Json<Envelope<HabitListPayload>>> {
    let frequency = query
        .frequency
        .as_deref()
        .unwrap_or_default()
        .parse::<FrequencyFilter>()
        .map_err(|error| ApiError::BadRequest(error.to_string()))?;
    let status = query
        .status
        .as_deref()
        .unwrap_or_default()
        .parse::<StatusFilter>()
        .map_err(|error| ApiError::BadRequest(error.to_string()))?;

    let scope = RequestScope::new(&state, &headers);
    let mut board = HabitBoard::new(scope.service.clone());
    board.refresh();
    board.set_frequency_filter(frequency);
    board.set_status_filter(status);

    let payload = HabitListPayload {
        frequency: frequency.to_string(),
        status: status.to_string(),
        total: board.habits().len(),
        habits: board.filtered_habits().to_vec(),
        completion_status: board.completion_status().clone(),
    };

    Ok(scope.respond(payload))
}

async fn create_habit(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(input): Json<NewHabit>,
) -> ApiResult<(StatusCode, Json<Envelope<Habit>>)> {
    let scope = RequestScope::new(&state, &headers);

    match scope.service.create_habit(&input) {
        Some(habit) => Ok((StatusCode::CREATED, scope.respond(habit))),
        None => Err(scope.reject(StatusCode::UNPROCESSABLE_ENTITY)),
    }
}

async fn get_habit(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<Habit>>> {
    let scope = RequestScope::new(&state, &headers);

    match scope.service.find_habit(&id) {
        Some(habit) => Ok(scope.respond(habit)),
        None => Err(scope.reject(StatusCode::NOT_FOUND)),
    }
}

async fn update_habit(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<HabitPatch>,
) -> ApiResult<Json<Envelope<Habit>>> {
    let scope = RequestScope::new(&state, &headers);

    match scope.service.update_habit(&id, &patch) {
        Some(habit) => Ok(scope.respond(habit)),
        None => Err(scope.reject(StatusCode::UNPROCESSABLE_ENTITY)),
    }
}

async fn delete_habit(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<serde_json::Value>>> {
    let scope = RequestScope::new(&state, &headers);

    if scope.service.delete_habit(&id) {
        Ok(scope.respond(json!({ "deleted": true, "habit_id": id })))
    } else {
        Err(scope.reject(StatusCode::UNPROCESSABLE_ENTITY))
    }
}

async fn toggle_habit(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<TogglePayload>>> {
    let scope = RequestScope::new(&state, &headers);

    let Some(habit) = scope.service.find_habit(&id) else {
        return Err(scope.reject(StatusCode::NOT_FOUND));
    };
    if !scope.service.toggle_habit_completion(&habit) {
        return Err(scope.reject(StatusCode::UNPROCESSABLE_ENTITY));
    }

    let completed_today = scope
        .service
        .check_habit_completion_status(std::slice::from_ref(&habit.id))
        .get(&habit.id)
        .copied()
        .unwrap_or(false);
    let refreshed = scope.service.find_habit(&habit.id);

    Ok(scope.respond(TogglePayload {
        habit_id: habit.id,
        completed_today,
        habit: refreshed,
    }))
}

async fn habit_history(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<HistoryPayload>>> {
    let scope = RequestScope::new(&state, &headers);

    let Some(habit) = scope.service.find_habit(&id) else {
        return Err(scope.reject(StatusCode::NOT_FOUND));
    };
    let dates = scope.service.completion_history(&habit.id);
    let today = scope.service.today();

    let payload = HistoryPayload {
        current_streak: streak::current_streak(habit.frequency, &dates, today),
        longest_streak: streak::longest_streak(habit.frequency, &dates, today),
        habit_id: habit.id,
        dates,
    };

    Ok(scope.respond(payload))
}

async fn completion_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<Envelope<HashMap<String, bool>>>> {
    let scope = RequestScope::new(&state, &headers);
    let ids = parse_ids(query.ids.as_deref().unwrap_or_default());
    let status = scope.service.check_habit_completion_status(&ids);

    Ok(scope.respond(status))
}

async fn statistics(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<Envelope<StatisticsReport>>> {
    let timeframe = query
        .timeframe
        .as_deref()
        .map(str::parse::<Timeframe>)
        .transpose()
        .map_err(|error| ApiError::BadRequest(error.to_string()))?
        .unwrap_or_default();

    let scope = RequestScope::new(&state, &headers);
    match scope.service.statistics(timeframe) {
        Some(report) => Ok(scope.respond(report)),
        None => Err(scope.reject(StatusCode::UNPROCESSABLE_ENTITY)),
    }
}

async fn reconcile_streaks(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<Json<Envelope<serde_json::Value>>> {
    let scope = RequestScope::new(&state, &headers);
    if scope.service.current_user().is_none() {
        // Let the service raise the sign-in notice.
        scope.service.reconcile_streaks();
        return Err(scope.reject(StatusCode::UNAUTHORIZED));
    }

    let corrected = scope.service.reconcile_streaks();
    Ok(scope.respond(json!({ "corrected": corrected })))
}

fn parse_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Rejected(StatusCode, Vec<Notice>),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Rejected(status, notices) => {
                let message = notices
                    .iter()
                    .map(|notice| notice.message.clone())
                    .next()
                    .unwrap_or_else(|| "Request rejected".to_string());
                (
                    status,
                    Json(json!({ "error": message, "notices": notices })),
                )
                    .into_response()
            }
            ApiError::Internal(error) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": error.to_string() })),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::habits::model::Frequency;
    use axum::http::HeaderValue;

    fn state() -> ApiState {
        ApiState {
            config: Arc::new(Config::default()),
            store: Arc::new(Database::open_in_memory().expect("database")),
            auth: Arc::new(Auth::in_memory()),
        }
    }

    fn headers_for(user: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, HeaderValue::from_str(user).expect("header"));
        headers
    }

    #[test]
    fn ids_are_split_on_commas() {
        assert_eq!(parse_ids(" a, b,,c "), vec!["a", "b", "c"]);
        assert!(parse_ids("").is_empty());
    }

    #[tokio::test]
    async fn create_then_list_through_handlers() {
        let state = state();

        let (code, Json(created)) = create_habit(
            State(state.clone()),
            headers_for("alice"),
            Json(NewHabit::new("Read", Frequency::Daily)),
        )
        .await
        .expect("created");
        assert_eq!(code, StatusCode::CREATED);
        assert_eq!(created.data.user_id, "alice");
        assert_eq!(created.notices.len(), 1);

        let Json(listed) = list_habits(
            State(state.clone()),
            headers_for("alice"),
            Query(HabitsQuery {
                frequency: Some("daily".to_string()),
                status: Some("pending".to_string()),
            }),
        )
        .await
        .expect("listed");
        assert_eq!(listed.data.total, 1);
        assert_eq!(listed.data.habits[0].id, created.data.id);

        let Json(other) = list_habits(
            State(state),
            headers_for("bob"),
            Query(HabitsQuery::default()),
        )
        .await
        .expect("listed");
        assert_eq!(other.data.total, 0);
    }

    #[tokio::test]
    async fn toggle_reports_completion_and_undo() {
        let state = state();
        let (_, Json(created)) = create_habit(
            State(state.clone()),
            headers_for("alice"),
            Json(NewHabit::new("Read", Frequency::Daily)),
        )
        .await
        .expect("created");

        let Json(toggled) = toggle_habit(
            State(state.clone()),
            headers_for("alice"),
            Path(created.data.id.clone()),
        )
        .await
        .expect("toggled");

        assert!(toggled.data.completed_today);
        assert_eq!(toggled.data.habit.map(|habit| habit.streak), Some(1));
        assert!(toggled.notices.iter().any(|notice| notice.action.is_some()));
    }

    #[tokio::test]
    async fn anonymous_create_is_rejected_with_notices() {
        let result = create_habit(
            State(state()),
            HeaderMap::new(),
            Json(NewHabit::new("Read", Frequency::Daily)),
        )
        .await;

        match result {
            Err(ApiError::Rejected(code, notices)) => {
                assert_eq!(code, StatusCode::UNPROCESSABLE_ENTITY);
                assert_eq!(notices.len(), 1);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_filter_is_a_bad_request() {
        let result = list_habits(
            State(state()),
            headers_for("alice"),
            Query(HabitsQuery {
                frequency: Some("hourly".to_string()),
                status: None,
            }),
        )
        .await;

        let response = result.expect_err("bad filter").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn server_session_is_used_without_header() {
        let state = state();
        state.auth.sign_in("carol").expect("sign in");

        let Json(status) = status(State(state), HeaderMap::new())
            .await
            .expect("status");
        assert_eq!(status.signed_in_user.as_deref(), Some("carol"));
        assert_eq!(status.habit_count, 0);
    }

    #[tokio::test]
    async fn status_and_completions_cover_only_the_caller() {
        let state = state();
        let (_, Json(created)) = create_habit(
            State(state.clone()),
            headers_for("alice"),
            Json(NewHabit::new("Read", Frequency::Daily)),
        )
        .await
        .expect("created");
        toggle_habit(
            State(state.clone()),
            headers_for("alice"),
            Path(created.data.id.clone()),
        )
        .await
        .expect("toggled");

        let Json(alice) = status(State(state.clone()), headers_for("alice"))
            .await
            .expect("status");
        assert_eq!(alice.habit_count, 1);
        assert!(alice.latest_completion.is_some());

        let Json(bob) = status(State(state.clone()), headers_for("bob"))
            .await
            .expect("status");
        assert_eq!(bob.habit_count, 0);
        assert_eq!(bob.latest_completion, None);

        let Json(anonymous) = status(State(state.clone()), HeaderMap::new())
            .await
            .expect("status");
        assert_eq!(anonymous.habit_count, 0);

        let Json(seen_by_bob) = completion_status(
            State(state),
            headers_for("bob"),
            Query(StatusQuery {
                ids: Some(created.data.id.clone()),
            }),
        )
        .await
        .expect("status");
        assert_eq!(seen_by_bob.data.get(&created.data.id), Some(&false));
    }
}

//! Axum + Askama reporting server: effort per month for a user or a team.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tally_core::{TicketCategory, UserId};
use tally_storage::{MonthlyEffort, TimeDb, UserRow};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "tally-web";

/// Pseudo-team covering every configured member.
pub const ALL_TEAMS: &str = "all teams";

pub const HISTORY_DAYS: i64 = 365;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TeamConfig {
    pub name: String,
    #[serde(default)]
    pub members_email: Vec<String>,
}

/// Reads `teams.yaml`: a list of `{name, members_email}`.
pub fn load_teams(path: &Path) -> anyhow::Result<Vec<TeamConfig>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("decoding {}", path.display()))
}

#[derive(Clone)]
pub struct AppState {
    pub db: TimeDb,
    pub teams: Vec<TeamConfig>,
    pub history_days: i64,
}

impl AppState {
    pub fn new(db: TimeDb, teams: Vec<TeamConfig>) -> Self {
        Self {
            db,
            teams,
            history_days: HISTORY_DAYS,
        }
    }
}

#[derive(Debug, Clone)]
struct TeamView {
    name: String,
    title: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    users: Vec<UserRow>,
    teams: Vec<TeamView>,
    history_days: i64,
}

#[derive(Debug, Deserialize, Default)]
struct MonthlyQuery {
    userid: Option<String>,
    team: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthRow {
    pub year: i32,
    pub month: u32,
    pub month_name: String,
    pub bug_seconds: f64,
    pub feature_seconds: f64,
    pub total_seconds: f64,
    pub seconds_by_category: BTreeMap<TicketCategory, f64>,
}

impl From<MonthlyEffort> for MonthRow {
    fn from(effort: MonthlyEffort) -> Self {
        Self {
            year: effort.year,
            month: effort.month,
            bug_seconds: effort.seconds(TicketCategory::Bug),
            feature_seconds: effort.seconds(TicketCategory::Feature),
            total_seconds: effort.total_seconds,
            month_name: effort.month_name,
            seconds_by_category: effort.seconds_by_category,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyReport {
    pub months: Vec<MonthRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/monthly", get(monthly_handler))
        .route("/user", get(monthly_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "reporting server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let users = match state.db.list_users().await {
        Ok(users) => users,
        Err(err) => return server_error(err.into()),
    };
    let known: Vec<String> = users.iter().map(|u| u.email.to_lowercase()).collect();

    let mut teams = vec![TeamView {
        name: ALL_TEAMS.to_string(),
        title: ALL_TEAMS.to_string(),
    }];
    for team in &state.teams {
        let missing: Vec<&str> = team
            .members_email
            .iter()
            .filter(|email| !known.contains(&email.to_lowercase()))
            .map(String::as_str)
            .collect();
        let title = if missing.is_empty() {
            team.name.clone()
        } else {
            format!("{} (no data for: {})", team.name, missing.join(", "))
        };
        teams.push(TeamView {
            name: team.name.clone(),
            title,
        });
    }

    render_html(IndexTemplate {
        users,
        teams,
        history_days: state.history_days,
    })
}

async fn monthly_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MonthlyQuery>,
) -> Response {
    let user_id = query
        .userid
        .as_deref()
        .and_then(|v| v.trim().parse::<UserId>().ok())
        .filter(|id| *id != 0);
    let team = query.team.as_deref().map(str::trim).filter(|t| !t.is_empty());

    let user_ids = match (user_id, team) {
        (Some(id), _) => vec![id],
        (None, Some(team)) => match team_members(&state, team).await {
            Ok(Some(ids)) => ids,
            Ok(None) => return json_error(StatusCode::NOT_FOUND, format!("unknown team `{team}`")),
            Err(err) => return server_error(err),
        },
        (None, None) => {
            return json_error(StatusCode::BAD_REQUEST, "specify `userid` or `team`".to_string())
        }
    };

    let since = Utc::now() - TimeDelta::days(state.history_days);
    match state.db.monthly_effort(Some(&user_ids), since).await {
        Ok(months) => Json(MonthlyReport {
            months: months.into_iter().map(MonthRow::from).collect(),
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

/// Known user ids for `team`, or `None` when no such team is configured.
/// Members who have never logged time are left out.
async fn team_members(state: &AppState, team: &str) -> anyhow::Result<Option<Vec<UserId>>> {
    let selected: Vec<&TeamConfig> = state
        .teams
        .iter()
        .filter(|t| team == ALL_TEAMS || t.name == team)
        .collect();
    if selected.is_empty() && team != ALL_TEAMS {
        return Ok(None);
    }

    let by_email = state.db.user_ids_by_email().await?;
    let mut ids: Vec<UserId> = selected
        .iter()
        .flat_map(|t| t.members_email.iter())
        .filter_map(|email| by_email.get(&email.to_lowercase()).copied())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    Ok(Some(ids))
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn json_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tally_core::{IssueRecord, SourceSystem, TimeEntryRecord};
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn teams() -> Vec<TeamConfig> {
        vec![
            TeamConfig {
                name: "Infra".into(),
                members_email: vec!["Ben@X.com".into(), "ghost@x.com".into()],
            },
            TeamConfig {
                name: "Apps".into(),
                members_email: vec!["ann@x.com".into()],
            },
            TeamConfig {
                name: "Empty".into(),
                members_email: vec!["nobody@x.com".into()],
            },
        ]
    }

    async fn seeded_state() -> AppState {
        let db = TimeDb::connect("sqlite::memory:").await.unwrap();
        let day = (Utc::now() - TimeDelta::days(10)).fixed_offset();
        db.upsert_issues(&[
            IssueRecord {
                source_system: SourceSystem::Jira,
                source_native_id: "1".into(),
                title: "Fix crash".into(),
                issue_type: "Bug".into(),
                story_points: None,
                created_at: Utc::now(),
            },
            IssueRecord {
                source_system: SourceSystem::Jira,
                source_native_id: "2".into(),
                title: "Theme API".into(),
                issue_type: "Story".into(),
                story_points: None,
                created_at: Utc::now(),
            },
        ])
        .await
        .unwrap();
        let entry = |email: &str, title: &str, hours: i64| TimeEntryRecord {
            source_system: SourceSystem::TMetric,
            email: email.into(),
            task_title: title.into(),
            start: day,
            end: day + TimeDelta::hours(hours),
        };
        db.upsert_time_entries(&[
            entry("ben@x.com", "Fix crash", 3),
            entry("ann@x.com", "Theme API", 2),
        ])
        .await
        .unwrap();
        AppState::new(db, teams())
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn months(body: &str) -> Vec<serde_json::Value> {
        let value: serde_json::Value = serde_json::from_str(body).unwrap();
        value["months"].as_array().unwrap().clone()
    }

    fn total(months: &[serde_json::Value], field: &str) -> f64 {
        months.iter().map(|m| m[field].as_f64().unwrap()).sum()
    }

    #[tokio::test]
    async fn index_lists_users_and_teams_with_missing_members() {
        let (status, html) = get(app(seeded_state().await), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(html.contains("ann@x.com"));
        assert!(html.contains(ALL_TEAMS));
        assert!(html.contains("Infra (no data for: ghost@x.com)"));
        assert!(html.contains(">Apps<"));
    }

    #[tokio::test]
    async fn monthly_requires_user_or_team() {
        let (status, body) = get(app(seeded_state().await), "/monthly").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("userid"));
    }

    #[tokio::test]
    async fn monthly_for_one_user() {
        let state = seeded_state().await;
        let ben = state.db.user_ids_by_email().await.unwrap()["ben@x.com"];
        let resp = app(state)
            .oneshot(
                Request::builder()
                    .uri(format!("/monthly?userid={ben}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let months = months(std::str::from_utf8(&body).unwrap());
        assert_eq!(total(&months, "bug_seconds"), 3.0 * 3600.0);
        assert_eq!(total(&months, "feature_seconds"), 0.0);
    }

    #[tokio::test]
    async fn all_teams_is_the_union_of_members() {
        let (status, body) = get(app(seeded_state().await), "/user?team=all%20teams").await;
        assert_eq!(status, StatusCode::OK);
        let months = months(&body);
        assert_eq!(total(&months, "total_seconds"), 5.0 * 3600.0);
        assert_eq!(months[0]["seconds_by_category"]["feature"].as_f64(), Some(2.0 * 3600.0));
    }

    #[tokio::test]
    async fn team_filters_by_member_email_case_insensitively() {
        let (status, body) = get(app(seeded_state().await), "/monthly?team=Infra").await;
        assert_eq!(status, StatusCode::OK);
        let months = months(&body);
        assert_eq!(total(&months, "total_seconds"), 3.0 * 3600.0);
    }

    #[tokio::test]
    async fn team_without_data_is_empty_and_unknown_team_is_not_found() {
        let state = seeded_state().await;
        let (status, body) = get(app(state.clone()), "/monthly?team=Empty").await;
        assert_eq!(status, StatusCode::OK);
        assert!(months(&body).is_empty());

        let (status, _) = get(app(state), "/monthly?team=Nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn teams_load_from_yaml_list() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("teams.yaml");
        std::fs::write(
            &path,
            "- name: Infra\n  members_email: [ben@x.com, ann@x.com]\n- name: Solo\n",
        )
        .unwrap();
        let teams = load_teams(&path).unwrap();
        assert_eq!(teams.len(), 2);
        assert_eq!(teams[0].members_email, vec!["ben@x.com", "ann@x.com"]);
        assert!(teams[1].members_email.is_empty());
        assert!(load_teams(&dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn month_rows_surface_bug_and_feature_totals() {
        let effort = MonthlyEffort {
            year: 2024,
            month: 1,
            month_name: "January".into(),
            total_seconds: 10.0,
            seconds_by_category: BTreeMap::from([
                (TicketCategory::Bug, 4.0),
                (TicketCategory::Other, 6.0),
            ]),
        };
        let row = MonthRow::from(effort);
        assert_eq!(row.bug_seconds, 4.0);
        assert_eq!(row.feature_seconds, 0.0);
    }
}

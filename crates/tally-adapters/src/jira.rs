//! JIRA issue search, paged until the tracker returns an empty page.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tally_core::{FetchWindow, IssueRecord, SourceSystem};
use tally_storage::{FetchRequest, HttpFetcher};
use tracing::info;

use crate::{
    config_path, read_yaml_config, require_non_empty, AdapterError, ConfigError, FetchStats,
    RecordSink, SourceAdapter,
};

pub const SOURCE_ID: &str = "jira";

const CREATED_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

fn default_story_points_field() -> String {
    "customfield_10004".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JiraConfig {
    /// Site root, e.g. `https://example.atlassian.net`.
    pub url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_story_points_field")]
    pub story_points_field: String,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default, rename = "startAt")]
    start_at: u64,
    #[serde(default)]
    total: u64,
    #[serde(default)]
    issues: Vec<JiraIssue>,
}

#[derive(Debug, Deserialize)]
struct JiraIssue {
    id: String,
    #[serde(default)]
    key: String,
    fields: JiraFields,
}

#[derive(Debug, Deserialize)]
struct JiraFields {
    #[serde(default)]
    summary: String,
    issuetype: JiraIssueType,
    created: String,
    #[serde(flatten)]
    custom: HashMap<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
struct JiraIssueType {
    name: String,
}

#[derive(Debug, Clone, Default)]
pub struct JiraAdapter {
    config: Option<JiraConfig>,
}

impl JiraAdapter {
    pub fn with_config(config: JiraConfig) -> Self {
        Self {
            config: Some(config),
        }
    }

    fn config(&self) -> Result<&JiraConfig, AdapterError> {
        self.config
            .as_ref()
            .ok_or(AdapterError::NotConfigured { source_id: SOURCE_ID })
    }

    fn search_request(config: &JiraConfig, window: &FetchWindow, offset: usize) -> FetchRequest {
        let url = format!(
            r#"{}/rest/api/2/search?startAt={offset}&jql=created>="{}"+AND+created<="{}""#,
            config.url.trim_end_matches('/'),
            window.start.format("%Y-%m-%d"),
            window.end.format("%Y-%m-%d"),
        );
        FetchRequest::get(url)
            .basic_auth(&config.username, &config.password)
            .header("Accept", "application/json")
    }
}

/// Decodes one search response into issue records.
pub fn parse_search_page(body: &[u8], story_points_field: &str) -> Result<Vec<IssueRecord>, AdapterError> {
    decode_page(body)?
        .issues
        .into_iter()
        .map(|issue| issue_record(issue, story_points_field))
        .collect()
}

fn decode_page(body: &[u8]) -> Result<SearchPage, AdapterError> {
    serde_json::from_slice(body)
        .map_err(|e| AdapterError::parse(SOURCE_ID, format!("invalid search response: {e}")))
}

fn issue_record(issue: JiraIssue, story_points_field: &str) -> Result<IssueRecord, AdapterError> {
    let created_at = DateTime::parse_from_str(&issue.fields.created, CREATED_FORMAT)
        .map_err(|e| {
            AdapterError::parse(
                SOURCE_ID,
                format!(
                    "issue {} has unparsable created time `{}`: {e}",
                    issue.key, issue.fields.created
                ),
            )
        })?
        .with_timezone(&Utc);
    let story_points = issue
        .fields
        .custom
        .get(story_points_field)
        .and_then(JsonValue::as_f64)
        .map(|points| points.trunc() as i32);

    Ok(IssueRecord {
        source_system: SourceSystem::Jira,
        source_native_id: issue.id,
        title: issue.fields.summary,
        issue_type: issue.fields.issuetype.name,
        story_points,
        created_at,
    })
}

#[async_trait]
impl SourceAdapter for JiraAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn display_name(&self) -> &'static str {
        "JIRA"
    }

    fn raw_extension(&self) -> &'static str {
        "json"
    }

    fn load_configuration(&mut self, config_dir: &Path) -> Result<(), ConfigError> {
        let path = config_path(config_dir, SOURCE_ID);
        let config: JiraConfig = read_yaml_config(&path)?;
        require_non_empty(&path, "url", &config.url)?;
        self.config = Some(config);
        Ok(())
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        sink: &dyn RecordSink,
        window: &FetchWindow,
    ) -> Result<FetchStats, AdapterError> {
        let config = self.config()?;
        let mut stats = FetchStats::default();
        let mut offset = 0usize;
        loop {
            let request = Self::search_request(config, window, offset);
            let response = http.fetch_bytes(SOURCE_ID, &request).await?;
            let page = decode_page(&response.body)?;
            info!(offset = page.start_at, total = page.total, "fetched JIRA issues");
            if page.issues.is_empty() {
                break;
            }

            let batch = page
                .issues
                .into_iter()
                .map(|issue| issue_record(issue, &config.story_points_field))
                .collect::<Result<Vec<_>, _>>()?;
            let report = sink.accept_issues(&batch).await?;
            offset += batch.len();
            stats.absorb_issues(batch.len(), report);
        }
        Ok(stats)
    }

    async fn fetch_raw(&self, http: &HttpFetcher, window: &FetchWindow) -> Result<Vec<u8>, AdapterError> {
        let config = self.config()?;
        let response = http
            .fetch_bytes(SOURCE_ID, &Self::search_request(config, window, 0))
            .await?;
        Ok(response.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE: &str = r#"{
        "startAt": 0,
        "total": 2,
        "issues": [
            {
                "id": "10001",
                "key": "TI-1",
                "fields": {
                    "summary": "Fix crash",
                    "issuetype": {"name": "Bug"},
                    "created": "2024-01-05T09:55:24.000+0200",
                    "customfield_10004": 3.5,
                    "assignee": {"emailAddress": "a@x.com"}
                }
            },
            {
                "id": "10002",
                "key": "TI-2",
                "fields": {
                    "summary": "Theme query API",
                    "issuetype": {"name": "Story"},
                    "created": "2024-01-06T10:00:00.000+0000",
                    "customfield_10004": null
                }
            }
        ]
    }"#;

    #[test]
    fn search_page_becomes_issue_records() {
        let records = parse_search_page(PAGE.as_bytes(), "customfield_10004").unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.source_system, SourceSystem::Jira);
        assert_eq!(first.source_native_id, "10001");
        assert_eq!(first.title, "Fix crash");
        assert_eq!(first.issue_type, "Bug");
        assert_eq!(first.story_points, Some(3));
        assert_eq!(
            first.created_at,
            DateTime::parse_from_rfc3339("2024-01-05T07:55:24Z").unwrap()
        );

        assert_eq!(records[1].story_points, None);
    }

    #[test]
    fn story_points_follow_the_configured_field() {
        let records = parse_search_page(PAGE.as_bytes(), "customfield_99999").unwrap();
        assert!(records.iter().all(|r| r.story_points.is_none()));
    }

    #[test]
    fn unparsable_created_time_is_a_parse_error() {
        let body = PAGE.replace("2024-01-05T09:55:24.000+0200", "yesterday");
        let err = parse_search_page(body.as_bytes(), "customfield_10004").unwrap_err();
        assert!(matches!(err, AdapterError::Parse { .. }));
        assert!(err.to_string().contains("TI-1"));
    }

    #[test]
    fn search_url_carries_window_dates_and_offset() {
        let config = JiraConfig {
            url: "https://example.test/".into(),
            username: "u".into(),
            password: "p".into(),
            story_points_field: default_story_points_field(),
        };
        let window = FetchWindow::new(
            DateTime::parse_from_rfc3339("2024-03-08T23:59:59+02:00").unwrap(),
            DateTime::parse_from_rfc3339("2024-03-10T23:59:59+02:00").unwrap(),
        );
        let request = JiraAdapter::search_request(&config, &window, 50);
        assert_eq!(
            request.url,
            r#"https://example.test/rest/api/2/search?startAt=50&jql=created>="2024-03-08"+AND+created<="2024-03-10""#
        );
        assert_eq!(request.basic_auth, Some(("u".into(), "p".into())));
    }

    #[test]
    fn config_loads_from_yaml_with_default_points_field() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("jira.yaml"),
            "url: https://example.test\nusername: u\npassword: p\n",
        )
        .unwrap();
        let mut adapter = JiraAdapter::default();
        adapter.load_configuration(dir.path()).unwrap();
        let config = adapter.config().unwrap();
        assert_eq!(config.story_points_field, "customfield_10004");

        std::fs::write(dir.path().join("jira.yaml"), "url: ''\nusername: u\npassword: p\n").unwrap();
        let err = JiraAdapter::default()
            .load_configuration(dir.path())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}

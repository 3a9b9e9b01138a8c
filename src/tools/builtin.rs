//! Reference tools over an in-memory training log.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::gateway::executor::{BackendError, BackendOutput, CallContext, ToolBackend};
use crate::gateway::registry::{RegistryError, ToolRegistry};
use crate::gateway::types::{ParameterKind, ParameterSpec, ToolDefinition};
use crate::gateway::value::{ParamValue, Parameters};

const DEFAULT_LIST_LIMIT: i64 = 10;
const MAX_LIST_LIMIT: i64 = 50;
const LIST_PACE: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Activity {
    id: i64,
    name: &'static str,
    sport: &'static str,
    date: &'static str,
    distance_km: f64,
    moving_time_secs: u64,
    laps: Vec<Lap>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Lap {
    index: u32,
    distance_km: f64,
    moving_time_secs: u64,
}

fn laps(distance_km: f64, moving_time_secs: u64, count: u32) -> Vec<Lap> {
    let per_lap_km = distance_km / f64::from(count);
    let per_lap_secs = moving_time_secs / u64::from(count);
    (1..=count)
        .map(|index| Lap {
            index,
            distance_km: per_lap_km,
            moving_time_secs: per_lap_secs,
        })
        .collect()
}

fn catalog() -> Vec<Activity> {
    vec![
        Activity {
            id: 1001,
            name: "Morning Run",
            sport: "running",
            date: "2024-05-01",
            distance_km: 10.0,
            moving_time_secs: 3_000,
            laps: laps(10.0, 3_000, 10),
        },
        Activity {
            id: 1002,
            name: "Tempo Intervals",
            sport: "running",
            date: "2024-05-03",
            distance_km: 8.0,
            moving_time_secs: 2_280,
            laps: laps(8.0, 2_280, 4),
        },
        Activity {
            id: 1003,
            name: "Endurance Ride",
            sport: "cycling",
            date: "2024-05-04",
            distance_km: 62.0,
            moving_time_secs: 8_100,
            laps: laps(62.0, 8_100, 2),
        },
        Activity {
            id: 1004,
            name: "Recovery Swim",
            sport: "swimming",
            date: "2024-05-05",
            distance_km: 1.5,
            moving_time_secs: 1_800,
            laps: laps(1.5, 1_800, 3),
        },
        Activity {
            id: 1005,
            name: "Long Run",
            sport: "running",
            date: "2024-05-06",
            distance_km: 21.1,
            moving_time_secs: 6_900,
            laps: laps(21.1, 6_900, 7),
        },
    ]
}

fn summary(activity: &Activity) -> Value {
    json!({
        "id": activity.id,
        "name": activity.name,
        "sport": activity.sport,
        "date": activity.date,
        "distanceKm": activity.distance_km,
    })
}

/// Profile of the calling athlete.
#[derive(Debug, Default)]
pub struct AthleteProfileTool;

#[async_trait]
impl ToolBackend for AthleteProfileTool {
    async fn execute(
        &self,
        ctx: &CallContext,
        _params: &Parameters,
    ) -> Result<BackendOutput, BackendError> {
        let activities = catalog();
        let total_km: f64 = activities.iter().map(|a| a.distance_km).sum();
        Ok(BackendOutput::new(json!({
            "athleteId": ctx.user_id().unwrap_or("anonymous"),
            "workspace": ctx.workspace(),
            "primarySport": "running",
            "activityCount": activities.len(),
            "totalDistanceKm": total_km,
        })))
    }
}

#[derive(Debug, Default)]
pub struct ActivityDetailsTool;

#[async_trait]
impl ToolBackend for ActivityDetailsTool {
    async fn execute(
        &self,
        _ctx: &CallContext,
        params: &Parameters,
    ) -> Result<BackendOutput, BackendError> {
        let id = params
            .get("activity_id")
            .and_then(ParamValue::as_i64)
            .ok_or_else(|| BackendError::InvalidInput("activity_id must be an integer".into()))?;
        let include_laps = params
            .get("include_laps")
            .and_then(ParamValue::as_bool)
            .unwrap_or(false);

        let activity = catalog()
            .into_iter()
            .find(|a| a.id == id)
            .ok_or_else(|| BackendError::InvalidInput(format!("no activity with id {id}")))?;

        let mut data = serde_json::to_value(&activity)
            .map_err(|e| BackendError::Failed(format!("serialize activity: {e}")))?;
        if !include_laps {
            if let Some(object) = data.as_object_mut() {
                object.remove("laps");
            }
        }
        Ok(BackendOutput::new(data))
    }
}

/// Emits one chunk per activity, most recent first.
#[derive(Debug, Default)]
pub struct ListActivitiesTool;

#[async_trait]
impl ToolBackend for ListActivitiesTool {
    async fn execute(
        &self,
        ctx: &CallContext,
        params: &Parameters,
    ) -> Result<BackendOutput, BackendError> {
        let limit = params
            .get("limit")
            .and_then(ParamValue::as_i64)
            .unwrap_or(DEFAULT_LIST_LIMIT);
        if !(1..=MAX_LIST_LIMIT).contains(&limit) {
            return Err(BackendError::InvalidInput(format!(
                "limit must be between 1 and {MAX_LIST_LIMIT}"
            )));
        }

        let mut activities = catalog();
        activities.sort_by(|a, b| b.date.cmp(a.date));
        let take = usize::try_from(limit).unwrap_or(usize::MAX);

        let mut sent = 0usize;
        for activity in activities.iter().take(take) {
            tokio::select! {
                () = ctx.cancelled() => return Err(BackendError::Cancelled),
                () = tokio::time::sleep(LIST_PACE) => {}
            }
            if !ctx.emit(summary(activity)) {
                return Err(BackendError::Cancelled);
            }
            sent += 1;
        }

        Ok(BackendOutput::new(json!({ "count": sent })))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct LogbookEntry {
    entry_id: String,
    date: NaiveDate,
    content: String,
}

/// Appends free-text notes to the caller's logbook.
#[derive(Debug, Default)]
pub struct LogbookTool {
    entries: RwLock<HashMap<String, Vec<LogbookEntry>>>,
}

impl LogbookTool {
    pub async fn entry_count(&self, user_id: &str) -> usize {
        self.entries.read().await.get(user_id).map_or(0, Vec::len)
    }
}

#[async_trait]
impl ToolBackend for LogbookTool {
    async fn execute(
        &self,
        ctx: &CallContext,
        params: &Parameters,
    ) -> Result<BackendOutput, BackendError> {
        let content = params
            .get("content")
            .and_then(ParamValue::as_str)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| BackendError::InvalidInput("content must not be empty".into()))?;
        let date = match params.get("date").and_then(ParamValue::as_str) {
            Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| {
                BackendError::InvalidInput(format!("date must be YYYY-MM-DD: {e}"))
            })?,
            None => Utc::now().date_naive(),
        };

        let entry = LogbookEntry {
            entry_id: Uuid::new_v4().to_string(),
            date,
            content: content.to_owned(),
        };
        let user = ctx.user_id().unwrap_or("anonymous").to_owned();

        let mut entries = self.entries.write().await;
        let log = entries.entry(user).or_default();
        log.push(entry.clone());

        Ok(BackendOutput::new(json!({
            "entry": entry,
            "entries": log.len(),
        })))
    }
}

/// Registry with the reference tools.
pub fn builtin_registry() -> Result<ToolRegistry, RegistryError> {
    Ok(ToolRegistry::builder()
        .register(
            ToolDefinition::new(
                "get-athlete-profile",
                "Profile and training totals for the calling athlete",
            )
            .example(json!({}), json!({"athleteId": "anonymous", "primarySport": "running"})),
            Arc::new(AthleteProfileTool),
        )?
        .register(
            ToolDefinition::new("get-activity-details", "Details of a single activity")
                .param(ParameterSpec::required(
                    "activity_id",
                    ParameterKind::Integer,
                    "Activity identifier",
                ))
                .param(ParameterSpec::optional(
                    "include_laps",
                    ParameterKind::Boolean,
                    "Include per-lap splits",
                ))
                .example(
                    json!({"activity_id": 1001}),
                    json!({"id": 1001, "name": "Morning Run"}),
                ),
            Arc::new(ActivityDetailsTool),
        )?
        .register(
            ToolDefinition::new(
                "list-activities",
                "Recent activities, one chunk per activity when streaming",
            )
            .param(ParameterSpec::optional(
                "limit",
                ParameterKind::Integer,
                "Maximum number of activities (1-50)",
            )),
            Arc::new(ListActivitiesTool),
        )?
        .register(
            ToolDefinition::new("update-logbook", "Add a note to the training logbook")
                .param(ParameterSpec::required(
                    "content",
                    ParameterKind::String,
                    "Note text",
                ))
                .param(ParameterSpec::optional(
                    "date",
                    ParameterKind::String,
                    "Entry date, YYYY-MM-DD; defaults to today",
                )),
            Arc::new(LogbookTool::default()),
        )?
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::executor::{CallerContext, ExecutorConfig, ToolExecutor};
    use crate::gateway::monitoring::NoopMonitor;
    use crate::gateway::types::ExecutionOptions;

    fn executor() -> ToolExecutor {
        ToolExecutor::new(
            Arc::new(builtin_registry().unwrap()),
            Arc::new(NoopMonitor),
            ExecutorConfig::default(),
        )
    }

    fn params(value: Value) -> Parameters {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn registers_all_tools() {
        let registry = builtin_registry().unwrap();
        assert_eq!(registry.len(), 4);
        assert!(!registry.is_empty());
        for name in [
            "get-athlete-profile",
            "get-activity-details",
            "list-activities",
            "update-logbook",
        ] {
            assert!(registry.is_tool_available(name), "{name}");
        }
    }

    #[tokio::test]
    async fn activity_details_hides_laps_by_default() {
        let exec = executor();
        let result = exec
            .execute_tool(
                "get-activity-details",
                params(json!({"activity_id": 1002})),
                CallerContext::new("req"),
            )
            .await
            .unwrap();
        assert_eq!(result.data["name"], "Tempo Intervals");
        assert!(result.data.get("laps").is_none());

        let result = exec
            .execute_tool(
                "get-activity-details",
                params(json!({"activity_id": 1002, "include_laps": true})),
                CallerContext::new("req"),
            )
            .await
            .unwrap();
        assert_eq!(result.data["laps"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn unknown_activity_is_a_validation_error() {
        let err = executor()
            .execute_tool(
                "get-activity-details",
                params(json!({"activity_id": 1})),
                CallerContext::new("req"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::gateway::error::ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn list_activities_buffers_chunks() {
        let result = executor()
            .execute_tool(
                "list-activities",
                params(json!({"limit": 3})),
                CallerContext::new("req"),
            )
            .await
            .unwrap();
        assert_eq!(result.data["count"], 3);
        assert_eq!(result.output.len(), 3);
        assert_eq!(result.output[0]["date"], "2024-05-06");
    }

    #[tokio::test]
    async fn list_activities_streams_to_consumer() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let caller = CallerContext::new("req").with_stream(Arc::new(move |chunk: Value| {
            sink.lock().unwrap().push(chunk);
            true
        }));
        let result = executor()
            .execute_tool_with_options(
                "list-activities",
                params(json!({"limit": 2})),
                caller,
                ExecutionOptions {
                    streaming: true,
                    ..ExecutionOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(result.output.is_empty());
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn logbook_is_per_user() {
        let tool = Arc::new(LogbookTool::default());
        let registry = ToolRegistry::builder()
            .register(
                ToolDefinition::new("update-logbook", "").param(ParameterSpec::required(
                    "content",
                    ParameterKind::String,
                    "",
                )),
                Arc::clone(&tool) as Arc<dyn ToolBackend>,
            )
            .unwrap()
            .build();
        let exec = ToolExecutor::new(
            Arc::new(registry),
            Arc::new(NoopMonitor),
            ExecutorConfig::default(),
        );

        let first = exec
            .execute_tool(
                "update-logbook",
                params(json!({"content": "Easy 5k", "date": "2024-05-07"})),
                CallerContext::new("r1").with_user("ada"),
            )
            .await
            .unwrap();
        assert_eq!(first.data["entries"], 1);
        assert_eq!(first.data["entry"]["date"], "2024-05-07");

        exec.execute_tool(
            "update-logbook",
            params(json!({"content": "Rest day"})),
            CallerContext::new("r2").with_user("grace"),
        )
        .await
        .unwrap();

        assert_eq!(tool.entry_count("ada").await, 1);
        assert_eq!(tool.entry_count("grace").await, 1);
        assert_eq!(tool.entry_count("nobody").await, 0);
    }

    #[tokio::test]
    async fn logbook_rejects_bad_date() {
        let mut p = Parameters::new();
        p.insert("content".into(), ParamValue::from("note"));
        p.insert("date".into(), ParamValue::from("07/05/2024"));
        let err = executor()
            .execute_tool("update-logbook", p, CallerContext::new("r"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::gateway::error::ErrorCode::ValidationError);
    }
}

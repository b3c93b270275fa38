//! 访问统计：记录页面浏览与分区点击，汇总日/周/月视图。

use axum::Json;
use axum::response::{IntoResponse, Response};
use chrono::{Duration, Local, NaiveDate, NaiveDateTime};
use serde_json::{Map, Value, json};

use crate::app::{ApiRequest, AppState, parse_json};
use crate::config::STATS_RETENTION_DAYS;
use crate::error::ApiError;
use crate::validation::is_empty;

const RESOURCE: &str = "stats";
const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
const CHART_DAYS: i64 = 14;

pub async fn get_stats(state: &AppState) -> Result<Response, ApiError> {
    let now = Local::now().naive_local();
    let stats = state.storage.read(RESOURCE, default_stats(now)).await;
    Ok(Json(with_summary(stats, now.date())).into_response())
}

/// 空请求体按一次页面浏览处理。
pub async fn record_visit(state: &AppState, mut request: ApiRequest) -> Result<Response, ApiError> {
    let bytes = request.body_bytes(state.max_body_size, "Request").await?;
    let visit = if bytes.is_empty() {
        json!({})
    } else {
        parse_json(&bytes)?
    };

    let now = Local::now().naive_local();
    state
        .storage
        .update(RESOURCE, default_stats(now), |stats| {
            apply_visit(stats, &visit, now)
        })
        .await?;
    Ok(Json(json!({"success": true})).into_response())
}

fn default_stats(now: NaiveDateTime) -> Value {
    json!({
        "total_views": 0,
        "unique_visitors": 0,
        "daily": {},
        "sections": {},
        "sessions": {},
        "created": now.format(TIMESTAMP_FORMAT).to_string(),
    })
}

fn day_key(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Removes `key` from `map`, yielding it as an object (empty if absent or
/// not an object). Callers put it back when done.
fn take_object(map: &mut Map<String, Value>, key: &str) -> Map<String, Value> {
    map.remove(key).map(into_object).unwrap_or_default()
}

fn increment(map: &mut Map<String, Value>, key: &str) {
    let current = map.get(key).and_then(Value::as_i64).unwrap_or(0);
    map.insert(key.to_string(), json!(current + 1));
}

/// 把一次访问合并进统计文档，并丢弃保留期之前的日数据与会话。
fn apply_visit(stats: Value, visit: &Value, now: NaiveDateTime) -> Value {
    let mut stats = into_object(stats);
    let today = day_key(now.date());
    let mut daily = take_object(&mut stats, "daily");
    let mut sessions = take_object(&mut stats, "sessions");

    match visit.get("type").and_then(Value::as_str).unwrap_or("pageview") {
        "pageview" => {
            increment(&mut stats, "total_views");
            stats.insert(
                "last_visit".into(),
                json!(now.format(TIMESTAMP_FORMAT).to_string()),
            );
            increment(&mut daily, &today);

            if let Some(session_id) = visit.get("session_id").filter(|id| !is_empty(id)) {
                let seen = sessions
                    .entry(today.clone())
                    .or_insert_with(|| json!([]));
                if !seen.is_array() {
                    *seen = json!([]);
                }
                if let Value::Array(ids) = seen
                    && !ids.contains(session_id)
                {
                    ids.push(session_id.clone());
                    increment(&mut stats, "unique_visitors");
                }
            }
        }
        "section" => {
            if let Some(section) = visit
                .get("section")
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
            {
                let mut sections = take_object(&mut stats, "sections");
                increment(&mut sections, section);
                stats.insert("sections".into(), Value::Object(sections));
            }
        }
        _ => {}
    }

    let cutoff = day_key(now.date() - Duration::days(STATS_RETENTION_DAYS));
    daily.retain(|day, _| day.as_str() >= cutoff.as_str());
    sessions.retain(|day, _| day.as_str() >= cutoff.as_str());
    stats.insert("daily".into(), Value::Object(daily));
    stats.insert("sessions".into(), Value::Object(sessions));
    Value::Object(stats)
}

/// 附加 today/week/month 计数与最近 14 天的图表数据。
fn with_summary(stats: Value, today: NaiveDate) -> Value {
    let mut stats = into_object(stats);
    let daily = stats
        .get("daily")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let views = |days_ago: i64| {
        daily
            .get(&day_key(today - Duration::days(days_ago)))
            .and_then(Value::as_i64)
            .unwrap_or(0)
    };

    let chart = (0..CHART_DAYS)
        .rev()
        .map(|days_ago| {
            json!({
                "date": day_key(today - Duration::days(days_ago)),
                "views": views(days_ago),
            })
        })
        .collect::<Vec<_>>();
    stats.insert("today_views".into(), json!(views(0)));
    stats.insert("week_views".into(), json!((0..7).map(views).sum::<i64>()));
    stats.insert("month_views".into(), json!((0..30).map(views).sum::<i64>()));
    stats.insert("chart_data".into(), Value::Array(chart));
    Value::Object(stats)
}

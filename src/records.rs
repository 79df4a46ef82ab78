use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::config::TimeZonePolicy;

/// One entry of the song catalog, as found in `song_data/**/*.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct SongRecord {
    pub song_id: Option<String>,
    pub title: Option<String>,
    pub artist_id: Option<String>,
    pub year: Option<i32>,
    pub duration: Option<f64>,
    pub artist_name: Option<String>,
    pub artist_location: Option<String>,
    pub artist_latitude: Option<f64>,
    pub artist_longitude: Option<f64>,
}

/// One user action from `log_data/**/*.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    #[serde(default, deserialize_with = "string_or_number")]
    pub user_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub gender: Option<String>,
    pub level: Option<String>,
    pub page: Option<String>,
    pub ts: Option<i64>,
    pub song: Option<String>,
    pub artist: Option<String>,
    pub session_id: Option<i64>,
    pub location: Option<String>,
    pub user_agent: Option<String>,
}

// userId shows up as "39" in most dumps and as 39 in a few.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// Parses every JSON value in `data`. Handles a single object as well as
/// newline-delimited records.
pub fn parse_json_values<T>(data: &[u8], key: &str) -> Result<Vec<T>>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::Deserializer::from_slice(data)
        .into_iter::<T>()
        .enumerate()
        .map(|(i, record)| record.map_err(|e| anyhow!("Error parsing record {} of {}: {}", i, key, e)))
        .collect()
}

pub fn songs_frame(records: &[SongRecord]) -> Result<DataFrame> {
    let df = DataFrame::new(vec![
        Series::new(
            "song_id".into(),
            records.iter().map(|r| r.song_id.clone()).collect::<Vec<_>>(),
        )
        .into_column(),
        Series::new(
            "title".into(),
            records.iter().map(|r| r.title.clone()).collect::<Vec<_>>(),
        )
        .into_column(),
        Series::new(
            "artist_id".into(),
            records.iter().map(|r| r.artist_id.clone()).collect::<Vec<_>>(),
        )
        .into_column(),
        Series::new(
            "year".into(),
            records.iter().map(|r| r.year).collect::<Vec<_>>(),
        )
        .into_column(),
        Series::new(
            "duration".into(),
            records.iter().map(|r| r.duration).collect::<Vec<_>>(),
        )
        .into_column(),
        Series::new(
            "artist_name".into(),
            records.iter().map(|r| r.artist_name.clone()).collect::<Vec<_>>(),
        )
        .into_column(),
        Series::new(
            "artist_location".into(),
            records
                .iter()
                .map(|r| r.artist_location.clone())
                .collect::<Vec<_>>(),
        )
        .into_column(),
        Series::new(
            "artist_latitude".into(),
            records.iter().map(|r| r.artist_latitude).collect::<Vec<_>>(),
        )
        .into_column(),
        Series::new(
            "artist_longitude".into(),
            records.iter().map(|r| r.artist_longitude).collect::<Vec<_>>(),
        )
        .into_column(),
    ])?;
    Ok(df)
}

/// Builds the raw event frame. `start_time` is the wall-clock reading of `ts`
/// under `time_zone`, null wherever `ts` is null or out of range.
pub fn events_frame(events: &[LogEvent], time_zone: TimeZonePolicy) -> Result<DataFrame> {
    fn strings(events: &[LogEvent], name: &str, f: fn(&LogEvent) -> &Option<String>) -> Column {
        Series::new(
            name.into(),
            events.iter().map(|e| f(e).clone()).collect::<Vec<_>>(),
        )
        .into_column()
    }

    let start_time = Series::new(
        "start_time".into(),
        events
            .iter()
            .map(|e| e.ts.and_then(|ts| wall_clock_millis(ts, time_zone)))
            .collect::<Vec<_>>(),
    )
    .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?;

    let df = DataFrame::new(vec![
        strings(events, "userId", |e| &e.user_id),
        strings(events, "firstName", |e| &e.first_name),
        strings(events, "lastName", |e| &e.last_name),
        strings(events, "gender", |e| &e.gender),
        strings(events, "level", |e| &e.level),
        strings(events, "page", |e| &e.page),
        Series::new(
            "ts".into(),
            events.iter().map(|e| e.ts).collect::<Vec<_>>(),
        )
        .into_column(),
        strings(events, "song", |e| &e.song),
        strings(events, "artist", |e| &e.artist),
        Series::new(
            "sessionId".into(),
            events.iter().map(|e| e.session_id).collect::<Vec<_>>(),
        )
        .into_column(),
        strings(events, "location", |e| &e.location),
        strings(events, "userAgent", |e| &e.user_agent),
        start_time.into_column(),
    ])?;
    Ok(df)
}

/// Epoch millis of the wall-clock time `ts` reads as in `time_zone`, so that
/// calendar fields extracted from a naive datetime match that zone.
pub fn wall_clock_millis(ts: i64, time_zone: TimeZonePolicy) -> Option<i64> {
    let instant = DateTime::<Utc>::from_timestamp_millis(ts)?;
    let naive = match time_zone {
        TimeZonePolicy::Utc => instant.naive_utc(),
        TimeZonePolicy::Local => instant.with_timezone(&chrono::Local).naive_local(),
    };
    Some(naive.and_utc().timestamp_millis())
}

use std::sync::Arc;

use polars::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

use crate::config::Config;
use crate::session::Session;
use crate::storage::{LocalStore, ObjectStore};

pub fn song_json(song_id: &str, title: &str, artist_id: &str, artist_name: &str) -> String {
    format!(
        r#"{{"num_songs": 1, "artist_id": "{}", "artist_latitude": 35.14968, "artist_longitude": -90.04892, "artist_location": "Memphis, TN", "artist_name": "{}", "song_id": "{}", "title": "{}", "duration": 200.0, "year": 2000}}"#,
        artist_id, artist_name, song_id, title
    )
}

pub fn event(page: &str, user_id: &str, song: &str, artist: &str, ts: i64) -> Value {
    json!({
        "artist": artist,
        "auth": "Logged In",
        "firstName": "Kaylee",
        "gender": "F",
        "itemInSession": 3,
        "lastName": "Summers",
        "length": 246.3,
        "level": "free",
        "location": "Phoenix-Mesa-Scottsdale, AZ",
        "method": "PUT",
        "page": page,
        "registration": 1540344794796.0,
        "sessionId": 139,
        "song": song,
        "status": 200,
        "ts": ts,
        "userAgent": "Mozilla/5.0",
        "userId": user_id
    })
}

/// Newline-delimited JSON, the layout of the event log files.
pub fn json_lines(events: &[Value]) -> String {
    events
        .iter()
        .map(|e| format!("{}\n", e))
        .collect()
}

/// A session over `<tmp>/in` and `<tmp>/out`, with `files` placed in the input.
pub async fn local_session(files: &[(&str, String)], extra_config: &str) -> (TempDir, Session) {
    let dir = tempfile::tempdir().unwrap();
    let input = LocalStore::new(dir.path().join("in"));
    for (key, body) in files {
        input.put(key, body.clone().into_bytes(), &[]).await.unwrap();
    }

    let config: Config = toml::from_str(&format!(
        "[storage]\ninput = {:?}\noutput = {:?}\n{}",
        dir.path().join("in").to_str().unwrap(),
        dir.path().join("out").to_str().unwrap(),
        extra_config
    ))
    .unwrap();
    config.validate().unwrap();

    let session = Session::new(
        Arc::new(input),
        Arc::new(LocalStore::new(dir.path().join("out"))),
        &config,
    );
    (dir, session)
}

pub fn strings(df: &DataFrame, column: &str) -> Vec<Option<String>> {
    df.column(column)
        .unwrap()
        .as_materialized_series()
        .str()
        .unwrap()
        .into_iter()
        .map(|v| v.map(|s| s.to_string()))
        .collect()
}

pub fn ints(df: &DataFrame, column: &str) -> Vec<Option<i64>> {
    df.column(column)
        .unwrap()
        .as_materialized_series()
        .cast(&DataType::Int64)
        .unwrap()
        .i64()
        .unwrap()
        .into_iter()
        .collect()
}

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveTime};
use polars::prelude::*;
use tracing::{debug, info};

use crate::config::LogsConfig;
use crate::records::{events_frame, parse_json_values, LogEvent};
use crate::session::Session;
use crate::storage::{list_matching, KeyGlob};
use crate::table_io::{read_table, write_table, WriteSummary, ARTISTS, SONGPLAYS, SONGS, TIME, USERS};

/// Page value of a log record that stands for a song being played.
pub const SONG_PLAY_PAGE: &str = "NextSong";

#[derive(Debug)]
pub struct LogStageSummary {
    pub files_processed: usize,
    pub raw_records: usize,
    pub song_play_events: usize,
    pub users: WriteSummary,
    pub time: WriteSummary,
    pub songplays: WriteSummary,
}

/// Loads the activity logs and writes the `users`, `time` and `song_plays`
/// tables. Expects `songs` and `artists` to already be in the output store.
pub async fn process_log_data(session: &Session) -> Result<LogStageSummary> {
    let glob = KeyGlob::new(&session.logs.glob)?;
    let keys = list_matching(session.input.as_ref(), &glob).await?;
    if keys.is_empty() {
        bail!(
            "No log files match {}",
            session.input.display(glob.as_str())
        );
    }
    info!("Found {} log files matching {}", keys.len(), glob.as_str());

    let mut records: Vec<LogEvent> = Vec::new();
    for key in &keys {
        let data = session.input.get(key).await?;
        let parsed: Vec<LogEvent> = parse_json_values(&data, key)?;
        debug!("Read {} records from {}", parsed.len(), key);
        records.extend(parsed);
    }

    let log_data = events_frame(&records, session.logs.time_zone)?;
    let plays = song_play_events(log_data.lazy()).collect()?;
    info!(
        "Kept {} {} events out of {} log records",
        plays.height(),
        SONG_PLAY_PAGE,
        records.len()
    );

    let users = users_table(plays.clone().lazy(), session.limits.users).collect()?;
    let users_summary = write_table(session.output.as_ref(), &USERS, &users).await?;

    let events = timed_events(plays.clone().lazy(), &session.logs).collect()?;
    debug!("{} distinct timed events", events.height());

    let time = time_table(events.clone().lazy(), session.limits.time).collect()?;
    let time_summary = write_table(session.output.as_ref(), &TIME, &time).await?;

    let songs = read_table(session.output.as_ref(), &SONGS)
        .await
        .context("songs table must be written before the log stage runs")?;
    let artists = read_table(session.output.as_ref(), &ARTISTS)
        .await
        .context("artists table must be written before the log stage runs")?;

    let lookup = song_lookup(songs.lazy(), artists.lazy());
    let songplays =
        songplays_table(events.lazy(), lookup, session.limits.songplays).collect()?;
    let matched = songplays.column("song_id")?.len() - songplays.column("song_id")?.null_count();
    info!(
        "Resolved song and artist for {} of {} song plays",
        matched,
        songplays.height()
    );
    let songplays_summary = write_table(session.output.as_ref(), &SONGPLAYS, &songplays).await?;

    Ok(LogStageSummary {
        files_processed: keys.len(),
        raw_records: records.len(),
        song_play_events: plays.height(),
        users: users_summary,
        time: time_summary,
        songplays: songplays_summary,
    })
}

pub fn song_play_events(log_data: LazyFrame) -> LazyFrame {
    log_data.filter(col("page").eq(lit(SONG_PLAY_PAGE)))
}

/// One row per non-blank userId, with the attributes of the user's most
/// recent event (a user's level changes when they upgrade).
pub fn users_table(plays: LazyFrame, limit: Option<u32>) -> LazyFrame {
    let users = plays
        .filter(
            col("userId")
                .is_not_null()
                .and(col("userId").str().strip_chars(lit(NULL)).neq(lit(""))),
        )
        .sort_by_exprs(
            [col("ts")],
            SortMultipleOptions::default().with_maintain_order(true),
        )
        .group_by_stable([col("userId")])
        .agg([
            col("firstName").last(),
            col("lastName").last(),
            col("gender").last(),
            col("level").last(),
        ]);
    apply_limit(users, limit)
}

/// Drops untimed and duplicate events, applies the configured date range and
/// derives the calendar columns. `event_seq` numbers the surviving events in
/// ingestion order.
pub fn timed_events(plays: LazyFrame, logs: &LogsConfig) -> LazyFrame {
    let mut events = plays
        .filter(col("ts").is_not_null().and(col("start_time").is_not_null()))
        .unique_stable(None, UniqueKeepStrategy::First);

    if let Some(from) = logs.from {
        events = events.filter(
            col("start_time")
                .cast(DataType::Int64)
                .gt_eq(lit(day_start_millis(from))),
        );
    }
    if let Some(next_day) = logs.until.and_then(|until| until.succ_opt()) {
        events = events.filter(
            col("start_time")
                .cast(DataType::Int64)
                .lt(lit(day_start_millis(next_day))),
        );
    }

    events
        .with_columns([
            col("start_time").dt().hour().cast(DataType::Int32).alias("hour"),
            col("start_time").dt().day().cast(DataType::Int32).alias("day"),
            col("start_time").dt().week().cast(DataType::Int32).alias("week"),
            col("start_time").dt().month().cast(DataType::Int32).alias("month"),
            col("start_time").dt().year().cast(DataType::Int32).alias("year"),
            // ISO Monday=1..Sunday=7 shifted to Sunday=1..Saturday=7
            ((col("start_time").dt().weekday().cast(DataType::Int32) % lit(7)) + lit(1))
                .alias("weekday"),
        ])
        .with_row_index("event_seq", None)
}

fn day_start_millis(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

pub fn time_table(events: LazyFrame, limit: Option<u32>) -> LazyFrame {
    let time = events
        .select([
            col("start_time"),
            col("hour"),
            col("day"),
            col("week"),
            col("month"),
            col("year"),
            col("weekday"),
        ])
        .unique_stable(None, UniqueKeepStrategy::First);
    apply_limit(time, limit)
}

/// Songs joined with artists on artist_id, reduced to the columns the event
/// join needs, with one row per (title, artist_name). When several songs share
/// a title and artist the lowest song_id is kept. The song's release year is
/// left out so it cannot clash with the play year.
pub fn song_lookup(songs: LazyFrame, artists: LazyFrame) -> LazyFrame {
    songs
        .join(
            artists.select([col("artist_id"), col("name").alias("artist_name")]),
            [col("artist_id")],
            [col("artist_id")],
            JoinArgs::new(JoinType::Inner),
        )
        .select([
            col("song_id"),
            col("title"),
            col("artist_id"),
            col("artist_name"),
        ])
        .sort_by_exprs(
            [col("song_id")],
            SortMultipleOptions::default().with_maintain_order(true),
        )
        .unique_stable(
            Some(vec!["title".into(), "artist_name".into()]),
            UniqueKeepStrategy::First,
        )
}

/// Resolves song_id/artist_id by exact (title, artist name) match and numbers
/// plays from 1 in start_time order, ties broken by ingestion order.
pub fn songplays_table(events: LazyFrame, lookup: LazyFrame, limit: Option<u32>) -> LazyFrame {
    let songplays = events
        .join(
            lookup,
            [col("song"), col("artist")],
            [col("title"), col("artist_name")],
            JoinArgs::new(JoinType::Left),
        )
        .sort_by_exprs(
            [col("start_time"), col("event_seq")],
            SortMultipleOptions::default().with_maintain_order(true),
        )
        .with_row_index("songplay_id", Some(1))
        .select([
            col("songplay_id").cast(DataType::Int64),
            col("year"),
            col("month"),
            col("start_time"),
            col("userId"),
            col("level"),
            col("song_id"),
            col("artist_id"),
            col("sessionId"),
            col("location"),
            col("userAgent"),
        ]);
    apply_limit(songplays, limit)
}

fn apply_limit(frame: LazyFrame, limit: Option<u32>) -> LazyFrame {
    match limit {
        Some(n) => frame.limit(n as IdxSize),
        None => frame,
    }
}

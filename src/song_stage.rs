use anyhow::{bail, Result};
use polars::prelude::*;
use tracing::{debug, info};

use crate::records::{parse_json_values, songs_frame, SongRecord};
use crate::session::Session;
use crate::storage::{list_matching, KeyGlob};
use crate::table_io::{write_table, WriteSummary, ARTISTS, SONGS};

#[derive(Debug)]
pub struct SongStageSummary {
    pub files_processed: usize,
    pub raw_records: usize,
    pub songs: WriteSummary,
    pub artists: WriteSummary,
}

/// Loads the song catalog and writes the `songs` and `artists` tables.
pub async fn process_song_data(session: &Session) -> Result<SongStageSummary> {
    let glob = KeyGlob::new(&session.songs.glob)?;
    let keys = list_matching(session.input.as_ref(), &glob).await?;
    if keys.is_empty() {
        bail!(
            "No song files match {}",
            session.input.display(glob.as_str())
        );
    }
    info!("Found {} song files matching {}", keys.len(), glob.as_str());

    let mut records: Vec<SongRecord> = Vec::new();
    for key in &keys {
        let data = session.input.get(key).await?;
        let parsed: Vec<SongRecord> = parse_json_values(&data, key)?;
        debug!("Read {} records from {}", parsed.len(), key);
        records.extend(parsed);
    }

    let song_data = songs_frame(&records)?;
    info!("Loaded {} song records", song_data.height());

    let songs = songs_table(song_data.clone().lazy()).collect()?;
    let songs_summary = write_table(session.output.as_ref(), &SONGS, &songs).await?;

    let artists = artists_table(song_data.lazy()).collect()?;
    let artists_summary = write_table(session.output.as_ref(), &ARTISTS, &artists).await?;

    Ok(SongStageSummary {
        files_processed: keys.len(),
        raw_records: records.len(),
        songs: songs_summary,
        artists: artists_summary,
    })
}

/// One row per song_id; the first record seen for an id wins.
pub fn songs_table(song_data: LazyFrame) -> LazyFrame {
    song_data
        .filter(col("song_id").is_not_null())
        .group_by_stable([col("song_id")])
        .agg([
            col("title").first(),
            col("artist_id").first(),
            col("year").first(),
            col("duration").first(),
        ])
}

/// One row per artist_id; the first record seen for an id wins.
pub fn artists_table(song_data: LazyFrame) -> LazyFrame {
    song_data
        .filter(col("artist_id").is_not_null())
        .group_by_stable([col("artist_id")])
        .agg([
            col("artist_name").first().alias("name"),
            col("artist_location").first().alias("location"),
            col("artist_latitude").first().alias("latitude"),
            col("artist_longitude").first().alias("longitude"),
        ])
}

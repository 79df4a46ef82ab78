use anyhow::{Context, Result};
use tracing::info;

use crate::log_stage::{process_log_data, LogStageSummary};
use crate::session::Session;
use crate::song_stage::{process_song_data, SongStageSummary};

#[derive(Debug)]
pub struct RunSummary {
    pub songs: SongStageSummary,
    pub logs: LogStageSummary,
}

/// Runs the song stage, then the log stage. The log stage joins against the
/// tables the song stage writes, so the two never overlap.
pub async fn run(session: &Session) -> Result<RunSummary> {
    info!("Processing song data");
    let songs = process_song_data(session)
        .await
        .context("Song stage failed")?;
    info!(
        "Song stage done: {} files, {} records, {} songs in {} parts, {} artists",
        songs.files_processed,
        songs.raw_records,
        songs.songs.rows,
        songs.songs.files,
        songs.artists.rows
    );

    info!("Processing log data");
    let logs = process_log_data(session)
        .await
        .context("Log stage failed")?;
    info!(
        "Log stage done: {} files, {} records ({} {} events), {} song plays, {} users, {} time rows",
        logs.files_processed,
        logs.raw_records,
        logs.song_play_events,
        crate::log_stage::SONG_PLAY_PAGE,
        logs.songplays.rows,
        logs.users.rows,
        logs.time.rows
    );

    Ok(RunSummary { songs, logs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table_io::SUCCESS_MARKER;
    use crate::test_support::{event, json_lines, local_session, song_json};

    #[tokio::test]
    async fn full_run_writes_every_table() {
        let (_dir, session) = local_session(
            &[
                ("song_data/A/A/A/TR1.json", song_json("S1", "T1", "A1", "Artist One")),
                (
                    "log_data/2018/11/2018-11-02-events.json",
                    json_lines(&[
                        event("NextSong", "8", "T1", "Artist One", 1541121934796),
                        event("Home", "8", "", "", 1541121935796),
                    ]),
                ),
                (
                    "log_data/2018/11/2018-11-03-events.json",
                    json_lines(&[event("NextSong", "9", "Other", "Someone", 1541208334796)]),
                ),
            ],
            "",
        )
        .await;

        let summary = run(&session).await.unwrap();
        assert_eq!(summary.songs.songs.rows, 1);
        assert_eq!(summary.songs.artists.rows, 1);
        assert_eq!(summary.logs.files_processed, 2);
        assert_eq!(summary.logs.raw_records, 3);
        assert_eq!(summary.logs.song_play_events, 2);
        assert_eq!(summary.logs.users.rows, 2);
        assert_eq!(summary.logs.time.rows, 2);
        assert_eq!(summary.logs.songplays.rows, 2);

        for table in ["songs", "artists", "users", "time", "song_plays"] {
            let marker = format!("{}/{}", table, SUCCESS_MARKER);
            let keys = session.output.list(&format!("{}/", table)).await.unwrap();
            assert!(keys.contains(&marker), "{} has no {}", table, SUCCESS_MARKER);
            assert!(keys.iter().any(|k| k.ends_with(".parquet")));
        }
    }

    #[tokio::test]
    async fn rerun_overwrites_previous_output() {
        let files = [
            ("song_data/A/A/A/TR1.json", song_json("S1", "T1", "A1", "Artist One")),
            (
                "log_data/2018/11/2018-11-02-events.json",
                json_lines(&[event("NextSong", "8", "T1", "Artist One", 1541121934796)]),
            ),
        ];
        let (_dir, session) = local_session(&files, "").await;

        run(&session).await.unwrap();
        let first = session.output.list("").await.unwrap();
        let summary = run(&session).await.unwrap();
        let second = session.output.list("").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(summary.logs.songplays.rows, 1);
    }

    #[tokio::test]
    async fn missing_logs_fail_the_run() {
        let (_dir, session) = local_session(
            &[("song_data/A/A/A/TR1.json", song_json("S1", "T1", "A1", "Artist One"))],
            "",
        )
        .await;

        let err = run(&session).await.unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("Log stage failed"));
        assert!(message.contains("No log files match"));
    }
}

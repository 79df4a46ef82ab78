use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use polars::prelude::*;
use std::collections::HashMap;
use std::io::Cursor;
use tracing::{debug, info};

use crate::storage::ObjectStore;

/// Directory name used for null partition values. An empty string is kept
/// as an empty value (`artist_id=`) so it reads back as itself.
pub const HIVE_DEFAULT_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";
pub const SUCCESS_MARKER: &str = "_SUCCESS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    Int32,
    Utf8,
}

/// An output table: its directory under the output root and the columns it
/// is hive-partitioned by, in directory nesting order.
#[derive(Debug, Clone, Copy)]
pub struct Table {
    pub name: &'static str,
    pub partition_by: &'static [(&'static str, PartitionType)],
}

pub const SONGS: Table = Table {
    name: "songs",
    partition_by: &[("year", PartitionType::Int32), ("artist_id", PartitionType::Utf8)],
};

pub const ARTISTS: Table = Table {
    name: "artists",
    partition_by: &[],
};

pub const USERS: Table = Table {
    name: "users",
    partition_by: &[],
};

pub const TIME: Table = Table {
    name: "time",
    partition_by: &[("year", PartitionType::Int32), ("month", PartitionType::Int32)],
};

pub const SONGPLAYS: Table = Table {
    name: "song_plays",
    partition_by: &[("year", PartitionType::Int32), ("month", PartitionType::Int32)],
};

impl Table {
    pub fn prefix(&self) -> String {
        format!("{}/", self.name)
    }

    fn partition_columns(&self) -> Vec<&'static str> {
        self.partition_by.iter().map(|(name, _)| *name).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    pub files: usize,
    pub rows: usize,
}

/// Replaces the contents of `table` with `df`.
pub async fn write_table(
    store: &dyn ObjectStore,
    table: &Table,
    df: &DataFrame,
) -> Result<WriteSummary> {
    let prefix = table.prefix();
    let removed = store.delete_prefix(&prefix).await?;
    if removed > 0 {
        debug!("Removed {} stale objects under {}", removed, store.display(&prefix));
    }

    let parts = split_partitions(table, df)?;
    let processed_timestamp = Utc::now().to_rfc3339();

    for (index, (dir, mut part)) in parts.iter().cloned().enumerate() {
        let key = format!("{}{}part-{:05}.snappy.parquet", prefix, dir, index);

        let mut buf = Vec::new();
        ParquetWriter::new(&mut buf)
            .with_compression(ParquetCompression::Snappy)
            .finish(&mut part)
            .with_context(|| format!("Error encoding {}", key))?;

        let columns = part
            .get_column_names()
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let metadata = [
            ("table", table.name.to_string()),
            ("format", "parquet".to_string()),
            ("record_count", part.height().to_string()),
            ("processed_timestamp", processed_timestamp.clone()),
            ("columns", columns),
        ];

        let size = buf.len();
        store.put(&key, buf, &metadata).await?;
        debug!(
            "Wrote {} ({} bytes, {} records)",
            store.display(&key),
            size,
            part.height()
        );
    }

    store
        .put(&format!("{}{}", prefix, SUCCESS_MARKER), Vec::new(), &[])
        .await?;

    info!(
        "Wrote table {} to {}: {} records in {} files",
        table.name,
        store.display(&prefix),
        df.height(),
        parts.len()
    );

    Ok(WriteSummary {
        files: parts.len(),
        rows: df.height(),
    })
}

/// Splits `df` into `(relative directory, frame without partition columns)`.
/// An empty frame is kept whole so its schema still lands in storage.
fn split_partitions(table: &Table, df: &DataFrame) -> Result<Vec<(String, DataFrame)>> {
    if table.partition_by.is_empty() || df.height() == 0 {
        return Ok(vec![(String::new(), df.clone())]);
    }

    let keys = table.partition_columns();
    let data_columns: Vec<PlSmallStr> = df
        .get_column_names()
        .into_iter()
        .filter(|name| !keys.iter().any(|key| *key == name.as_str()))
        .cloned()
        .collect();

    df.partition_by_stable(keys.clone(), true)?
        .into_iter()
        .map(|part| -> Result<(String, DataFrame)> {
            let mut dir = String::new();
            for key in &keys {
                let value = part.column(key)?.as_materialized_series().get(0)?;
                dir.push_str(&format!("{}={}/", key, partition_value(&value)));
            }
            Ok((dir, part.select(data_columns.clone())?))
        })
        .collect()
}

fn partition_value(value: &AnyValue) -> String {
    let text = match value {
        AnyValue::Null => return HIVE_DEFAULT_PARTITION.to_string(),
        AnyValue::String(s) => s.to_string(),
        AnyValue::StringOwned(s) => s.to_string(),
        other => other.to_string(),
    };
    urlencoding::encode(&text).into_owned()
}

/// Reads every parquet file of `table` back into one frame, re-attaching
/// partition columns from the directory names.
pub async fn read_table(store: &dyn ObjectStore, table: &Table) -> Result<DataFrame> {
    let prefix = table.prefix();
    let keys: Vec<String> = store
        .list(&prefix)
        .await?
        .into_iter()
        .filter(|key| key.ends_with(".parquet"))
        .collect();

    if keys.is_empty() {
        bail!(
            "No parquet files found for table {} at {}",
            table.name,
            store.display(&prefix)
        );
    }

    let mut frames: Vec<LazyFrame> = Vec::with_capacity(keys.len());
    for key in &keys {
        let data = store.get(key).await?;
        let mut df = ParquetReader::new(Cursor::new(data))
            .finish()
            .map_err(|e| anyhow!("Error reading {}: {}", store.display(key), e))?;

        let values = parse_partition_path(&key[prefix.len()..])
            .with_context(|| format!("Bad partition path {}", key))?;
        for (name, kind) in table.partition_by {
            if df.get_column_index(name).is_some() {
                continue;
            }
            let raw = values
                .get(*name)
                .ok_or_else(|| anyhow!("{} is missing partition column {}", key, name))?;
            let column = partition_column(name, *kind, raw.as_deref(), df.height())
                .with_context(|| format!("Bad partition value in {}", key))?;
            df.with_column(column)?;
        }
        frames.push(df.lazy());
    }

    let df = concat(frames, UnionArgs::default())?.collect()?;
    debug!(
        "Read table {} from {}: {} records in {} files",
        table.name,
        store.display(&prefix),
        df.height(),
        keys.len()
    );
    Ok(df)
}

/// `year=2018/month=11/part-00000.snappy.parquet` gives {year: 2018, month: 11}.
fn parse_partition_path(relative: &str) -> Result<HashMap<String, Option<String>>> {
    let mut segments: Vec<&str> = relative.split('/').collect();
    segments.pop();

    let mut values = HashMap::new();
    for segment in segments {
        let (name, raw) = segment
            .split_once('=')
            .ok_or_else(|| anyhow!("segment {} is not name=value", segment))?;
        let value = if raw == HIVE_DEFAULT_PARTITION {
            None
        } else {
            Some(urlencoding::decode(raw)?.into_owned())
        };
        values.insert(name.to_string(), value);
    }
    Ok(values)
}

fn partition_column(
    name: &str,
    kind: PartitionType,
    raw: Option<&str>,
    height: usize,
) -> Result<Column> {
    let series = match kind {
        PartitionType::Int32 => {
            let value = raw
                .map(|s| s.parse::<i32>())
                .transpose()
                .with_context(|| format!("{} is not an integer", raw.unwrap_or_default()))?;
            Series::new(name.into(), vec![value; height])
        }
        PartitionType::Utf8 => Series::new(name.into(), vec![raw.map(str::to_string); height]),
    };
    Ok(series.into_column())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use std::collections::BTreeSet;

    fn sample_songs() -> DataFrame {
        df!(
            "song_id" => ["S1", "S2", "S3", "S4"],
            "title" => ["T1", "T2", "T3", "T4"],
            "artist_id" => [Some("A1"), Some("A1"), Some("A/2"), None],
            "year" => [Some(2000), Some(2000), Some(0), None],
            "duration" => [200.0, 180.5, 99.9, 12.0]
        )
        .unwrap()
    }

    fn string_set(df: &DataFrame, column: &str) -> BTreeSet<String> {
        df.column(column)
            .unwrap()
            .as_materialized_series()
            .str()
            .unwrap()
            .into_iter()
            .flatten()
            .map(|s| s.to_string())
            .collect()
    }

    #[tokio::test]
    async fn partitioned_round_trip_keeps_rows_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let songs = sample_songs();

        let summary = write_table(&store, &SONGS, &songs).await.unwrap();
        assert_eq!(summary, WriteSummary { files: 3, rows: 4 });

        let back = read_table(&store, &SONGS).await.unwrap();
        assert_eq!(back.height(), songs.height());
        assert_eq!(string_set(&back, "song_id"), string_set(&songs, "song_id"));
        assert_eq!(string_set(&back, "artist_id"), string_set(&songs, "artist_id"));
        assert_eq!(back.column("year").unwrap().dtype(), &DataType::Int32);
        assert_eq!(back.column("year").unwrap().null_count(), 1);
    }

    #[tokio::test]
    async fn writes_hive_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        write_table(&store, &SONGS, &sample_songs()).await.unwrap();

        let keys = store.list("songs/").await.unwrap();
        assert!(keys.contains(&"songs/year=2000/artist_id=A1/part-00000.snappy.parquet".to_string()));
        assert!(keys.contains(&"songs/year=0/artist_id=A%2F2/part-00001.snappy.parquet".to_string()));
        assert!(keys.contains(
            &"songs/year=__HIVE_DEFAULT_PARTITION__/artist_id=__HIVE_DEFAULT_PARTITION__/part-00002.snappy.parquet"
                .to_string()
        ));
        assert!(keys.contains(&"songs/_SUCCESS".to_string()));

        let file = store
            .get("songs/year=2000/artist_id=A1/part-00000.snappy.parquet")
            .await
            .unwrap();
        let part = ParquetReader::new(Cursor::new(file)).finish().unwrap();
        assert_eq!(part.height(), 2);
        assert!(part.get_column_index("year").is_none());
        assert!(part.get_column_index("artist_id").is_none());
    }

    #[tokio::test]
    async fn empty_and_null_partition_values_stay_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let songs = df!(
            "song_id" => ["S1", "S2"],
            "title" => ["T1", "T2"],
            "artist_id" => [Some(""), None],
            "year" => [Some(2000), Some(2000)],
            "duration" => [200.0, 180.5]
        )
        .unwrap();

        write_table(&store, &SONGS, &songs).await.unwrap();
        let keys = store.list("songs/").await.unwrap();
        assert!(keys.contains(&"songs/year=2000/artist_id=/part-00000.snappy.parquet".to_string()));
        assert!(keys.contains(
            &"songs/year=2000/artist_id=__HIVE_DEFAULT_PARTITION__/part-00001.snappy.parquet"
                .to_string()
        ));

        let back = read_table(&store, &SONGS)
            .await
            .unwrap()
            .sort(["song_id"], SortMultipleOptions::default())
            .unwrap();
        let artist_ids: Vec<Option<String>> = back
            .column("artist_id")
            .unwrap()
            .as_materialized_series()
            .str()
            .unwrap()
            .into_iter()
            .map(|v| v.map(str::to_string))
            .collect();
        assert_eq!(artist_ids, vec![Some(String::new()), None]);
    }

    #[tokio::test]
    async fn rewrite_replaces_previous_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        write_table(&store, &SONGS, &sample_songs()).await.unwrap();

        let smaller = sample_songs().head(Some(1));
        write_table(&store, &SONGS, &smaller).await.unwrap();

        let back = read_table(&store, &SONGS).await.unwrap();
        assert_eq!(back.height(), 1);
        assert!(!dir.path().join("songs").join("year=0").exists());
    }

    #[tokio::test]
    async fn empty_table_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let empty = sample_songs().head(Some(0));

        let summary = write_table(&store, &SONGS, &empty).await.unwrap();
        assert_eq!(summary, WriteSummary { files: 1, rows: 0 });

        let back = read_table(&store, &SONGS).await.unwrap();
        assert_eq!(back.height(), 0);
        assert_eq!(back.width(), 5);
    }

    #[tokio::test]
    async fn unpartitioned_table_is_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let artists = df!(
            "artist_id" => ["A1", "A2"],
            "name" => ["N1", "N2"]
        )
        .unwrap();

        write_table(&store, &ARTISTS, &artists).await.unwrap();
        assert_eq!(
            store.list("artists/").await.unwrap(),
            vec![
                "artists/_SUCCESS".to_string(),
                "artists/part-00000.snappy.parquet".to_string(),
            ]
        );
        assert!(read_table(&store, &ARTISTS).await.unwrap().equals(&artists));
    }

    #[tokio::test]
    async fn reading_missing_table_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let err = read_table(&store, &ARTISTS).await.unwrap_err();
        assert!(err.to_string().contains("No parquet files found for table artists"));
    }

    #[test]
    fn parses_partition_segments() {
        let values =
            parse_partition_path("year=2018/month=__HIVE_DEFAULT_PARTITION__/part-00000.snappy.parquet")
                .unwrap();
        assert_eq!(values["year"].as_deref(), Some("2018"));
        assert_eq!(values["month"], None);

        let empty = parse_partition_path("year=2000/artist_id=/part-00000.snappy.parquet").unwrap();
        assert_eq!(empty["artist_id"].as_deref(), Some(""));

        assert!(parse_partition_path("oops/part-00000.snappy.parquet").is_err());
        assert!(parse_partition_path("part-00000.snappy.parquet").unwrap().is_empty());
    }
}

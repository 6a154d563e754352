//! Durable entry storage backed by a single SQLite file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use xkm_core::{Entry, SearchTerm};

pub const CRATE_NAME: &str = "xkm-storage";

pub const DEFAULT_DATABASE_PATH: &str = "database.db";

const CREATE_ENTRY_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS xkcd (
        num INTEGER UNIQUE,
        title TEXT,
        img TEXT,
        alt TEXT,
        transcript TEXT
    )
"#;

const SELECT_ALL: &str = r#"
    SELECT num, title, img, alt, transcript
      FROM xkcd
     ORDER BY num ASC
"#;

// instr() is a literal, case-sensitive substring test; LIKE would treat % and _ as wildcards.
const SELECT_MATCHING: &str = r#"
    SELECT num, title, img, alt, transcript
      FROM xkcd
     WHERE instr(title, ?1) > 0
        OR instr(img, ?1) > 0
        OR instr(alt, ?1) > 0
        OR instr(transcript, ?1) > 0
     ORDER BY num ASC
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("opening entry store {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },
    #[error("entry #{num} is already stored")]
    Duplicate { num: u32 },
    #[error("inserting entry #{num}: {source}")]
    Write {
        num: u32,
        #[source]
        source: sqlx::Error,
    },
    #[error("searching for {term:?}: {source}")]
    Search {
        term: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("reading entry store: {0}")]
    Read(#[source] sqlx::Error),
    #[error("stored row is not a valid entry: {0}")]
    Corrupt(String),
    #[error("closing entry store: {0}")]
    Close(#[source] sqlx::Error),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Keyed, append-only collection of entries.
///
/// Implementations must accept concurrent `insert` calls and serialize them internally.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Highest stored entry number, `None` for an empty store.
    async fn highest_stored_num(&self) -> Result<Option<u32>, StoreError>;

    /// Adds `entry`; fails with [`StoreError::Duplicate`] if its number is already present.
    async fn insert(&self, entry: &Entry) -> Result<(), StoreError>;

    /// Matching entries, ascending by number.
    async fn search(&self, term: &SearchTerm) -> Result<Vec<Entry>, StoreError>;
}

#[derive(Debug)]
pub struct SqliteEntryStore {
    pool: SqlitePool,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SqliteEntryStore {
    /// Open (creating if needed) the database at `path` and ensure the entry table exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let unavailable = |source: sqlx::Error| StoreError::Unavailable {
            path: path.clone(),
            source,
        };

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(unavailable)?;

        sqlx::query(CREATE_ENTRY_TABLE)
            .execute(&pool)
            .await
            .map_err(unavailable)?;

        info!(path = %path.display(), "entry store ready");
        Ok(Self {
            pool,
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) FROM xkcd")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::Read)?;
        let count: i64 = row.try_get(0).map_err(StoreError::Read)?;
        Ok(count.max(0) as u64)
    }

    /// Fold the write-ahead log back into the main file and release all connections.
    pub async fn close(&self) -> Result<(), StoreError> {
        let checkpoint = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await;
        self.pool.close().await;
        checkpoint.map_err(StoreError::Close)?;
        debug!(path = %self.path.display(), "entry store closed");
        Ok(())
    }
}

#[async_trait]
impl EntryStore for SqliteEntryStore {
    async fn highest_stored_num(&self) -> Result<Option<u32>, StoreError> {
        let row = sqlx::query("SELECT MAX(num) FROM xkcd")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::Read)?;
        let highest: Option<i64> = row.try_get(0).map_err(StoreError::Read)?;
        highest.map(entry_num).transpose()
    }

    async fn insert(&self, entry: &Entry) -> Result<(), StoreError> {
        let _writer = self.write_lock.lock().await;

        let result = sqlx::query(
            r#"
            INSERT INTO xkcd (num, title, img, alt, transcript)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(i64::from(entry.num))
        .bind(&entry.title)
        .bind(&entry.image)
        .bind(&entry.alt)
        .bind(&entry.transcript)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate { num: entry.num })
            }
            Err(source) => Err(StoreError::Write {
                num: entry.num,
                source,
            }),
        }
    }

    async fn search(&self, term: &SearchTerm) -> Result<Vec<Entry>, StoreError> {
        let query = match term {
            SearchTerm::All => sqlx::query(SELECT_ALL),
            SearchTerm::Contains(needle) => sqlx::query(SELECT_MATCHING).bind(needle.as_str()),
        };

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|source| StoreError::Search {
                term: term.to_string(),
                source,
            })?;

        rows.iter().map(row_to_entry).collect()
    }
}

fn entry_num(raw: i64) -> Result<u32, StoreError> {
    u32::try_from(raw)
        .ok()
        .filter(|num| *num > 0)
        .ok_or_else(|| StoreError::Corrupt(format!("entry number {raw} out of range")))
}

fn row_to_entry(row: &SqliteRow) -> Result<Entry, StoreError> {
    let num: Option<i64> = row.try_get("num").map_err(StoreError::Read)?;
    let num = num
        .ok_or_else(|| StoreError::Corrupt("entry without a number".to_string()))
        .and_then(entry_num)?;
    let text = |column: &str| -> Result<String, StoreError> {
        let value: Option<String> = row.try_get(column).map_err(StoreError::Read)?;
        Ok(value.unwrap_or_default())
    };

    Ok(Entry {
        num,
        title: text("title")?,
        image: text("img")?,
        alt: text("alt")?,
        transcript: text("transcript")?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use tempfile::{tempdir, TempDir};

    fn entry(num: u32, title: &str) -> Entry {
        Entry {
            num,
            title: title.to_string(),
            image: format!("https://imgs.xkcd.com/comics/{num}.png"),
            alt: format!("alt text for {title}"),
            transcript: String::new(),
        }
    }

    async fn open_temp() -> (TempDir, SqliteEntryStore) {
        let dir = tempdir().expect("tempdir");
        let store = SqliteEntryStore::open(dir.path().join("database.db"))
            .await
            .expect("open store");
        (dir, store)
    }

    fn nums(entries: &[Entry]) -> Vec<u32> {
        entries.iter().map(|e| e.num).collect()
    }

    #[tokio::test]
    async fn empty_store_has_no_highest_entry() {
        let (_dir, store) = open_temp().await;
        assert_eq!(store.highest_stored_num().await.unwrap(), None);
        assert!(store.search(&SearchTerm::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reopening_keeps_schema_and_rows() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("database.db");

        let store = SqliteEntryStore::open(&path).await.unwrap();
        store.insert(&entry(1, "Barrel - Part 1")).await.unwrap();
        store.close().await.unwrap();

        let reopened = SqliteEntryStore::open(&path).await.unwrap();
        assert_eq!(reopened.highest_stored_num().await.unwrap(), Some(1));
        assert_eq!(reopened.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn second_insert_of_same_number_is_a_duplicate() {
        let (_dir, store) = open_temp().await;
        store.insert(&entry(42, "first")).await.unwrap();

        let err = store.insert(&entry(42, "second")).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { num: 42 }));
        assert!(err.is_duplicate());

        let rows = store.search(&SearchTerm::All).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "first");
    }

    #[tokio::test]
    async fn highest_entry_is_max_not_row_count() {
        let (_dir, store) = open_temp().await;
        store.insert(&entry(1, "one")).await.unwrap();
        store.insert(&entry(7, "seven")).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(store.highest_stored_num().await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn wildcard_lists_everything_in_ascending_order() {
        let (_dir, store) = open_temp().await;
        for num in [5, 2, 9, 1] {
            store.insert(&entry(num, "t")).await.unwrap();
        }
        let rows = store.search(&SearchTerm::parse("-")).await.unwrap();
        assert_eq!(nums(&rows), vec![1, 2, 5, 9]);
    }

    #[tokio::test]
    async fn substring_search_covers_all_text_columns_case_sensitively() {
        let (_dir, store) = open_temp().await;
        store.insert(&entry(1, "Barrel - Part 1")).await.unwrap();
        store
            .insert(&Entry {
                transcript: "[[A boy sits in a barrel]]".into(),
                ..entry(2, "Petit Trees")
            })
            .await
            .unwrap();
        store.insert(&entry(3, "Island")).await.unwrap();

        let by_title = store.search(&SearchTerm::parse("Barrel")).await.unwrap();
        assert_eq!(nums(&by_title), vec![1]);

        let by_transcript = store.search(&SearchTerm::parse("barrel")).await.unwrap();
        assert_eq!(nums(&by_transcript), vec![2]);

        let by_image = store.search(&SearchTerm::parse("comics/3.png")).await.unwrap();
        assert_eq!(nums(&by_image), vec![3]);

        let by_alt = store.search(&SearchTerm::parse("alt text for")).await.unwrap();
        assert_eq!(nums(&by_alt), vec![1, 2, 3]);

        let none = store.search(&SearchTerm::parse("velociraptor")).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn query_control_characters_match_literally() {
        let (_dir, store) = open_temp().await;
        store.insert(&entry(1, "plain")).await.unwrap();
        store.insert(&entry(2, "100% sure")).await.unwrap();
        store.insert(&entry(3, r#"say "hi""#)).await.unwrap();
        store.insert(&entry(4, "it's_here")).await.unwrap();

        let percent = store.search(&SearchTerm::parse("%")).await.unwrap();
        assert_eq!(nums(&percent), vec![2]);

        let quote = store.search(&SearchTerm::parse("\"")).await.unwrap();
        assert_eq!(nums(&quote), vec![3]);

        let underscore = store.search(&SearchTerm::parse("_")).await.unwrap();
        assert_eq!(nums(&underscore), vec![4]);

        let injection = store
            .search(&SearchTerm::parse("' OR 1=1 --"))
            .await
            .unwrap();
        assert!(injection.is_empty());

        let injection = store
            .search(&SearchTerm::parse(r#"" OR "" = ""#))
            .await
            .unwrap();
        assert!(injection.is_empty());
        assert_eq!(store.count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn inserted_entry_round_trips_through_search() {
        let (_dir, store) = open_temp().await;
        let original = Entry {
            num: 353,
            title: "Python".into(),
            image: "https://imgs.xkcd.com/comics/python.png".into(),
            alt: "I wrote 20 short programs in Python yesterday.".into(),
            transcript: "[[ Guy 1 is talking to Guy 2, who is floating in the sky ]]".into(),
        };
        store.insert(&original).await.unwrap();

        let rows = store.search(&SearchTerm::All).await.unwrap();
        assert_eq!(rows, vec![original]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_inserts_are_all_kept() {
        let (_dir, store) = open_temp().await;
        let store = Arc::new(store);

        let handles = (1..=50u32)
            .map(|num| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.insert(&entry(num, &format!("comic {num}"))).await })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.expect("join").expect("insert");
        }

        let rows = store.search(&SearchTerm::All).await.unwrap();
        assert_eq!(nums(&rows), (1..=50).collect::<Vec<_>>());
        assert!(rows
            .iter()
            .all(|e| e.title == format!("comic {}", e.num) && e.image.ends_with(&format!("/{}.png", e.num))));
        assert_eq!(store.highest_stored_num().await.unwrap(), Some(50));
    }
}

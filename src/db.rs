use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub password_hash: String,
    pub full_name: String,
}

/// A tracked interval. `end_at` is `None` while the entry is open.
/// Both timestamps are Unix seconds.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TimeEntry {
    pub id: i64,
    pub user_id: i64,
    pub start_at: i64,
    pub end_at: Option<i64>,
}

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        email TEXT NOT NULL UNIQUE COLLATE NOCASE,
        password_hash TEXT NOT NULL,
        full_name TEXT NOT NULL,
        created_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS time_entries (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id),
        start_at BIGINT NOT NULL,
        end_at BIGINT
    )",
    "CREATE INDEX IF NOT EXISTS idx_time_entries_user_start
        ON time_entries (user_id, start_at)",
    // One open entry per user.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_time_entries_open
        ON time_entries (user_id) WHERE end_at IS NULL",
    "CREATE TABLE IF NOT EXISTS app_settings (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        logo_path TEXT
    )",
];

pub async fn setup_pool(db_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("Invalid database url: {}", db_url))?
        .create_if_missing(true)
        .foreign_keys(true);

    Ok(SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?)
}

pub async fn setup_db(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA.iter() {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("Failed to create schema")?;
    }

    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

/// Returns `None` if the email is already taken.
pub async fn write_user(
    pool: &SqlitePool,
    email: &str,
    password_hash: &str,
    full_name: &str,
    created_at: i64,
) -> Result<Option<i64>> {
    let res = sqlx::query(
        "INSERT INTO users (email, password_hash, full_name, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(email)
    .bind(password_hash)
    .bind(full_name)
    .bind(created_at)
    .execute(pool)
    .await;

    match res {
        Ok(done) => Ok(Some(done.last_insert_rowid())),
        Err(e) if is_unique_violation(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn read_user(pool: &SqlitePool, id: i64) -> Result<Option<User>> {
    Ok(sqlx::query_as::<_, User>(
        "SELECT id, email, password_hash, full_name FROM users WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?)
}

pub async fn read_user_by_email(pool: &SqlitePool, email: &str) -> Result<Option<User>> {
    Ok(sqlx::query_as::<_, User>(
        "SELECT id, email, password_hash, full_name FROM users WHERE email = ?",
    )
    .bind(email)
    .fetch_optional(pool)
    .await?)
}

/// Opens a new entry unless the user already has one open. The check and the
/// insert are a single statement, and the partial unique index catches any
/// writer that slips past it. Returns `None` when an entry is already open.
pub async fn write_open_entry(pool: &SqlitePool, user_id: i64, start_at: i64) -> Result<Option<i64>> {
    let res = sqlx::query(
        "INSERT INTO time_entries (user_id, start_at)
        SELECT ?, ?
        WHERE NOT EXISTS (
            SELECT 1 FROM time_entries WHERE user_id = ? AND end_at IS NULL
        )",
    )
    .bind(user_id)
    .bind(start_at)
    .bind(user_id)
    .execute(pool)
    .await;

    match res {
        Ok(done) if done.rows_affected() == 1 => Ok(Some(done.last_insert_rowid())),
        Ok(_) => Ok(None),
        Err(e) if is_unique_violation(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// The most recently created open entry for the user, if any.
pub async fn read_open_entry(pool: &SqlitePool, user_id: i64) -> Result<Option<TimeEntry>> {
    Ok(sqlx::query_as::<_, TimeEntry>(
        "SELECT id, user_id, start_at, end_at FROM time_entries
        WHERE user_id = ? AND end_at IS NULL
        ORDER BY id DESC LIMIT 1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?)
}

/// Sets the end timestamp. Returns `false` if the entry was not open anymore.
pub async fn close_entry(pool: &SqlitePool, id: i64, end_at: i64) -> Result<bool> {
    let done = sqlx::query("UPDATE time_entries SET end_at = ? WHERE id = ? AND end_at IS NULL")
        .bind(end_at)
        .bind(id)
        .execute(pool)
        .await?;

    Ok(done.rows_affected() == 1)
}

pub async fn read_entry(pool: &SqlitePool, id: i64) -> Result<Option<TimeEntry>> {
    Ok(sqlx::query_as::<_, TimeEntry>(
        "SELECT id, user_id, start_at, end_at FROM time_entries WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?)
}

/// Entries of the user that started at or after `since`, oldest first.
pub async fn read_entries_since(pool: &SqlitePool, user_id: i64, since: i64) -> Result<Vec<TimeEntry>> {
    Ok(sqlx::query_as::<_, TimeEntry>(
        "SELECT id, user_id, start_at, end_at FROM time_entries
        WHERE user_id = ? AND start_at >= ?
        ORDER BY start_at, id",
    )
    .bind(user_id)
    .bind(since)
    .fetch_all(pool)
    .await?)
}

pub async fn count_open_entries(pool: &SqlitePool, user_id: i64) -> Result<i64> {
    let rec: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM time_entries WHERE user_id = ? AND end_at IS NULL")
            .bind(user_id)
            .fetch_one(pool)
            .await?;

    Ok(rec.0)
}

pub async fn read_logo_filename(pool: &SqlitePool) -> Result<Option<String>> {
    let rec: Option<(Option<String>,)> =
        sqlx::query_as("SELECT logo_path FROM app_settings WHERE id = 1")
            .fetch_optional(pool)
            .await?;

    Ok(rec.and_then(|r| r.0))
}

pub async fn ensure_settings_row(pool: &SqlitePool) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO app_settings (id, logo_path) VALUES (1, NULL)")
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn write_logo_filename(pool: &SqlitePool, filename: &str) -> Result<()> {
    sqlx::query("UPDATE app_settings SET logo_path = ? WHERE id = 1")
        .bind(filename)
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::distributions::Alphanumeric;
    use rand::{thread_rng, Rng};

    pub(crate) fn random_name() -> String {
        thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect()
    }

    pub(crate) async fn setup_test_db() -> Result<SqlitePool> {
        let path = std::env::temp_dir().join(format!("{}_test.db", random_name()));
        let pool = setup_pool(&format!("sqlite://{}", path.display())).await?;
        setup_db(&pool).await?;

        Ok(pool)
    }

    pub(crate) async fn setup_user(pool: &SqlitePool) -> Result<i64> {
        let email = format!("{}@example.com", random_name());
        write_user(pool, &email, "not-a-real-hash", "Test User", 0)
            .await?
            .context("random email collided")
    }

    #[tokio::test]
    async fn test_setup_db_is_idempotent() -> Result<()> {
        let pool = setup_test_db().await?;
        setup_db(&pool).await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_write_and_read_user() -> Result<()> {
        let pool = setup_test_db().await?;

        let id = write_user(&pool, "ada@example.com", "hash", "Ada Lovelace", 10)
            .await?
            .unwrap();

        let exp_user = User {
            id,
            email: "ada@example.com".to_string(),
            password_hash: "hash".to_string(),
            full_name: "Ada Lovelace".to_string(),
        };

        assert_eq!(read_user(&pool, id).await?, Some(exp_user.clone()));
        assert_eq!(read_user_by_email(&pool, "ada@example.com").await?, Some(exp_user));
        assert_eq!(read_user_by_email(&pool, "nobody@example.com").await?, None);

        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_email_ignores_case() -> Result<()> {
        let pool = setup_test_db().await?;

        assert!(write_user(&pool, "ada@example.com", "hash", "Ada", 0).await?.is_some());
        assert!(write_user(&pool, "ADA@example.com", "hash", "Ada", 0).await?.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn test_only_one_open_entry() -> Result<()> {
        let pool = setup_test_db().await?;
        let user_id = setup_user(&pool).await?;

        let first = write_open_entry(&pool, user_id, 100).await?;
        assert!(first.is_some());
        assert!(write_open_entry(&pool, user_id, 200).await?.is_none());
        assert_eq!(count_open_entries(&pool, user_id).await?, 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_unique_index_rejects_second_open_entry() -> Result<()> {
        let pool = setup_test_db().await?;
        let user_id = setup_user(&pool).await?;

        write_open_entry(&pool, user_id, 100).await?;

        // A plain insert bypassing the conditional check still fails.
        let res = sqlx::query("INSERT INTO time_entries (user_id, start_at) VALUES (?, ?)")
            .bind(user_id)
            .bind(200)
            .execute(&pool)
            .await;
        assert!(res.is_err());

        // Closed entries are not constrained.
        sqlx::query("INSERT INTO time_entries (user_id, start_at, end_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(10)
            .bind(20)
            .execute(&pool)
            .await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_close_entry() -> Result<()> {
        let pool = setup_test_db().await?;
        let user_id = setup_user(&pool).await?;

        let id = write_open_entry(&pool, user_id, 100).await?.unwrap();
        let open = read_open_entry(&pool, user_id).await?.unwrap();
        assert_eq!(open.id, id);

        assert!(close_entry(&pool, id, 160).await?);
        assert!(!close_entry(&pool, id, 170).await?);

        let entry = read_entry(&pool, id).await?.unwrap();
        assert_eq!(entry.end_at, Some(160));
        assert!(read_open_entry(&pool, user_id).await?.is_none());

        // A new entry can be opened once the previous one is closed.
        assert!(write_open_entry(&pool, user_id, 200).await?.is_some());

        Ok(())
    }

    #[tokio::test]
    async fn test_read_entries_since() -> Result<()> {
        let pool = setup_test_db().await?;
        let user_id = setup_user(&pool).await?;
        let other_id = setup_user(&pool).await?;

        for (start, end) in [(50, 60), (100, 150), (200, 260)] {
            let id = write_open_entry(&pool, user_id, start).await?.unwrap();
            close_entry(&pool, id, end).await?;
        }
        write_open_entry(&pool, other_id, 120).await?;

        let entries = read_entries_since(&pool, user_id, 100).await?;
        let starts: Vec<i64> = entries.iter().map(|e| e.start_at).collect();
        assert_eq!(starts, vec![100, 200]);

        Ok(())
    }

    #[tokio::test]
    async fn test_logo_filename() -> Result<()> {
        let pool = setup_test_db().await?;

        assert_eq!(read_logo_filename(&pool).await?, None);

        ensure_settings_row(&pool).await?;
        ensure_settings_row(&pool).await?;
        assert_eq!(read_logo_filename(&pool).await?, None);

        write_logo_filename(&pool, "logo-1.png").await?;
        assert_eq!(read_logo_filename(&pool).await?, Some("logo-1.png".to_string()));

        Ok(())
    }
}

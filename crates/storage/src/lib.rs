use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scriba_core::{NewScript, Script, ScriptStore, StoreError};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::debug;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect sqlite database at {database_path}"))?;

        let store = Self { pool };
        store.apply_pragmas().await?;
        store.ensure_schema().await?;
        debug!(database_path, "sqlite store ready");
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn apply_pragmas(&self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // The primary key on name is what makes create atomic; a racing insert
    // surfaces as a unique violation instead of a second row.
    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scripts (
                name TEXT PRIMARY KEY,
                author_id INTEGER NOT NULL,
                code TEXT NOT NULL,
                description TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure scripts schema")?;
        Ok(())
    }
}

#[async_trait]
impl ScriptStore for SqliteStore {
    async fn get_by_name(&self, name: &str) -> Result<Option<Script>, StoreError> {
        let row = sqlx::query(
            "SELECT name, author_id, code, description, created_at \
             FROM scripts \
             WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(into_other)?;
        row.as_ref().map(row_to_script).transpose()
    }

    async fn list_all(&self) -> Result<Vec<Script>, StoreError> {
        let rows = sqlx::query(
            "SELECT name, author_id, code, description, created_at \
             FROM scripts \
             ORDER BY created_at, rowid",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(into_other)?;
        rows.iter().map(row_to_script).collect()
    }

    async fn create(&self, script: NewScript) -> Result<Script, StoreError> {
        let created_at = Utc::now();
        sqlx::query(
            "INSERT INTO scripts (name, author_id, code, description, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&script.name)
        .bind(script.author_id)
        .bind(&script.code)
        .bind(&script.description)
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|err| map_unique_violation(err, &script.name))?;

        Ok(Script {
            name: script.name,
            author_id: script.author_id,
            code: script.code,
            description: script.description,
            created_at,
        })
    }

    async fn rename(&self, old_name: &str, new_name: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE scripts SET name = ? WHERE name = ?")
            .bind(new_name)
            .bind(old_name)
            .execute(&self.pool)
            .await
            .map_err(|err| map_unique_violation(err, new_name))?;
        if result.rows_affected() == 0 {
            return Err(into_other(sqlx::Error::RowNotFound));
        }
        Ok(())
    }

    async fn change_description(&self, name: &str, description: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE scripts SET description = ? WHERE name = ?")
            .bind(description)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(into_other)?;
        if result.rows_affected() == 0 {
            return Err(into_other(sqlx::Error::RowNotFound));
        }
        Ok(())
    }

    async fn delete_by_name(&self, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM scripts WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(into_other)?;
        Ok(result.rows_affected() > 0)
    }
}

fn into_other(err: sqlx::Error) -> StoreError {
    StoreError::Other(anyhow::Error::new(err).context("sqlite query failed"))
}

fn map_unique_violation(err: sqlx::Error, name: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::DuplicateName(name.to_string())
        }
        _ => into_other(err),
    }
}

fn parse_dt(value: &str) -> Result<DateTime<Utc>, StoreError> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
        .map_err(StoreError::Other)?
        .with_timezone(&Utc))
}

fn row_to_script(row: &sqlx::sqlite::SqliteRow) -> Result<Script, StoreError> {
    Ok(Script {
        name: row.try_get("name").map_err(into_other)?,
        author_id: row.try_get("author_id").map_err(into_other)?,
        code: row.try_get("code").map_err(into_other)?,
        description: row.try_get("description").map_err(into_other)?,
        created_at: parse_dt(&row.try_get::<String, _>("created_at").map_err(into_other)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn setup_store() -> SqliteStore {
        let db_path = format!("/tmp/scriba-storage-test-{}.db", Uuid::new_v4());
        SqliteStore::connect(&db_path).await.unwrap()
    }

    fn new_script(name: &str, author_id: i64) -> NewScript {
        NewScript {
            name: name.to_string(),
            author_id,
            code: "print(\"testing\")".to_string(),
            description: format!("description of {name}"),
        }
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let store = setup_store().await;
        let created = store.create(new_script("weather", 11)).await.unwrap();
        assert_eq!(created.name, "weather");

        let fetched = store.get_by_name("weather").await.unwrap().unwrap();
        assert_eq!(fetched.author_id, 11);
        assert_eq!(fetched.code, "print(\"testing\")");
        assert_eq!(fetched.description, "description of weather");
        assert_eq!(fetched.created_at, created.created_at);

        assert!(store.get_by_name("Weather").await.unwrap().is_none());
        assert!(store.get_by_name("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_create_reports_name() {
        let store = setup_store().await;
        store.create(new_script("solo", 11)).await.unwrap();

        let err = store.create(new_script("solo", 22)).await.unwrap_err();
        match err {
            StoreError::DuplicateName(name) => assert_eq!(name, "solo"),
            StoreError::Other(other) => panic!("expected duplicate, got {other:#}"),
        }

        // The original row is untouched.
        let kept = store.get_by_name("solo").await.unwrap().unwrap();
        assert_eq!(kept.author_id, 11);
    }

    #[tokio::test]
    async fn list_preserves_creation_order() {
        let store = setup_store().await;
        for name in ["first", "second", "third"] {
            store.create(new_script(name, 11)).await.unwrap();
        }

        let names: Vec<String> = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn rename_moves_the_row_and_guards_collisions() {
        let store = setup_store().await;
        store.create(new_script("alpha", 11)).await.unwrap();
        store.create(new_script("beta", 22)).await.unwrap();

        store.rename("alpha", "gamma").await.unwrap();
        assert!(store.get_by_name("alpha").await.unwrap().is_none());
        let moved = store.get_by_name("gamma").await.unwrap().unwrap();
        assert_eq!(moved.author_id, 11);

        let err = store.rename("gamma", "beta").await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName(name) if name == "beta"));
    }

    #[tokio::test]
    async fn change_description_updates_only_target() {
        let store = setup_store().await;
        store.create(new_script("alpha", 11)).await.unwrap();
        store.create(new_script("beta", 22)).await.unwrap();

        store
            .change_description("alpha", "brand new words")
            .await
            .unwrap();
        let alpha = store.get_by_name("alpha").await.unwrap().unwrap();
        assert_eq!(alpha.description, "brand new words");
        let beta = store.get_by_name("beta").await.unwrap().unwrap();
        assert_eq!(beta.description, "description of beta");
    }

    #[tokio::test]
    async fn delete_reports_idempotence() {
        let store = setup_store().await;
        store.create(new_script("target", 11)).await.unwrap();

        assert!(store.delete_by_name("target").await.unwrap());
        assert!(!store.delete_by_name("target").await.unwrap());
        assert!(store.get_by_name("target").await.unwrap().is_none());
    }
}

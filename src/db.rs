use crate::config::Config;
use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Target screen for device-aware cropping. `scale` multiplies the CSS
/// dimensions into physical pixels.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceProfile {
    pub id: i64,
    pub name: String,
    pub width: i64,
    pub height: i64,
    pub scale: Option<f64>,
    pub is_default: bool,
}

impl DeviceProfile {
    pub fn physical_width(&self) -> f64 {
        self.width as f64 * self.scale.unwrap_or(1.0)
    }

    pub fn physical_height(&self) -> f64 {
        self.height as f64 * self.scale.unwrap_or(1.0)
    }
}

impl Database {
    pub async fn new(config: &Config) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create db directory {:?}", parent))?;
            }
        }
        let db_url = format!("sqlite://{}?mode=rwc", config.db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .context("connect to sqlite")?;
        let db = Self { pool };
        db.init_schema().await?;
        db.seed_default_profile().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        let schema = r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS device_profiles (
          id INTEGER PRIMARY KEY,
          name TEXT NOT NULL UNIQUE,
          width INTEGER NOT NULL,
          height INTEGER NOT NULL,
          scale REAL,
          is_default INTEGER NOT NULL DEFAULT 0
        );
        "#;
        sqlx::query(schema).execute(&self.pool).await?;
        Ok(())
    }

    async fn seed_default_profile(&self) -> Result<()> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM device_profiles")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        if count > 0 {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO device_profiles (name, width, height, scale, is_default)
            VALUES
              ('desktop-fhd', 1920, 1080, NULL, 1),
              ('desktop-4k', 3840, 2160, NULL, 0),
              ('phone-tall', 390, 844, 3.0, 0)
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_device_profile(&self, id: i64) -> Result<Option<DeviceProfile>> {
        let row = sqlx::query(
            "SELECT id, name, width, height, scale, is_default FROM device_profiles WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_profile))
    }

    pub async fn list_device_profiles(&self) -> Result<Vec<DeviceProfile>> {
        let rows = sqlx::query(
            "SELECT id, name, width, height, scale, is_default FROM device_profiles ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_profile).collect())
    }
}

fn row_to_profile(row: sqlx::sqlite::SqliteRow) -> DeviceProfile {
    DeviceProfile {
        id: row.get("id"),
        name: row.get("name"),
        width: row.get("width"),
        height: row.get("height"),
        scale: row.get("scale"),
        is_default: row.get::<i64, _>("is_default") == 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_dimensions_apply_scale() {
        let profile = DeviceProfile {
            id: 1,
            name: "phone-tall".to_string(),
            width: 390,
            height: 844,
            scale: Some(3.0),
            is_default: false,
        };
        assert_eq!(profile.physical_width(), 1170.0);
        assert_eq!(profile.physical_height(), 2532.0);
    }

    #[test]
    fn missing_scale_defaults_to_one() {
        let profile = DeviceProfile {
            id: 1,
            name: "desktop-fhd".to_string(),
            width: 1920,
            height: 1080,
            scale: None,
            is_default: true,
        };
        assert_eq!(profile.physical_width(), 1920.0);
        assert_eq!(profile.physical_height(), 1080.0);
    }
}

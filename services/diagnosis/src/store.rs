use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Plant reference row
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Plant {
    #[serde(rename = "nama_tanaman")]
    pub name: String,
    #[serde(rename = "desc_tanaman")]
    pub description: String,
}

/// One row of the plant/disease/solution join
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct DiseaseSolution {
    pub plant_name: String,
    pub disease_name: String,
    pub solution: String,
}

/// Solution resolved for a disease
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Solution {
    pub id: i32,
    pub description: String,
}

/// History row joined with its plant, disease and solution
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct HistoryEntry {
    pub id: String,
    pub plant_name: String,
    pub disease_name: String,
    pub solution: String,
    pub image_url: String,
    pub date: NaiveDate,
}

/// History row to insert once every foreign key has resolved
#[derive(Debug, Clone, PartialEq)]
pub struct NewHistoryRecord {
    pub id: String,
    pub date: NaiveDate,
    pub plant_id: i32,
    pub disease_id: i32,
    pub solution_id: i32,
    pub image_url: String,
}

const HISTORY_QUERY: &str = r#"
    SELECT h.id_history AS id,
           t.nama_tanaman AS plant_name,
           p.nama_penyakit AS disease_name,
           s.desc_solusi AS solution,
           h.image AS image_url,
           h.tgl_history AS date
    FROM history h
    JOIN tanaman t ON h.id_tanaman = t.id_tanaman
    JOIN penyakit p ON h.id_penyakit = p.id_penyakit
    JOIN solusi s ON h.id_solusi = s.id_solusi
    ORDER BY h.tgl_history DESC
"#;

/// Relational access used by the HTTP handlers and the diagnosis flow
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DiagnosisStore: Send + Sync {
    /// Round-trip a trivial query to prove the store is reachable
    async fn ping(&self) -> Result<()>;

    async fn get_plant(&self, plant_id: i32) -> Result<Option<Plant>>;

    async fn list_disease_solutions(&self) -> Result<Vec<DiseaseSolution>>;

    /// All history rows, newest date first
    async fn list_history(&self) -> Result<Vec<HistoryEntry>>;

    async fn find_plant_id(&self, plant_name: &str) -> Result<Option<i32>>;

    async fn find_disease_id(&self, disease_name: &str, plant_id: i32) -> Result<Option<i32>>;

    /// First solution row for the disease in store order
    async fn find_solution(&self, disease_id: i32) -> Result<Option<Solution>>;

    async fn insert_history(&self, record: &NewHistoryRecord) -> Result<()>;
}

/// MySQL-backed store
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    /// Create a new store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to MySQL")?;

        info!("Connected to MySQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl DiagnosisStore for MySqlStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database connection check failed")?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_plant(&self, plant_id: i32) -> Result<Option<Plant>> {
        let plant = sqlx::query_as::<_, Plant>(
            r#"
            SELECT nama_tanaman AS name, desc_tanaman AS description
            FROM tanaman
            WHERE id_tanaman = ?
            "#,
        )
        .bind(plant_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query plant")?;

        Ok(plant)
    }

    async fn list_disease_solutions(&self) -> Result<Vec<DiseaseSolution>> {
        let rows = sqlx::query_as::<_, DiseaseSolution>(
            r#"
            SELECT tanaman.nama_tanaman AS plant_name,
                   penyakit.nama_penyakit AS disease_name,
                   solusi.desc_solusi AS solution
            FROM tanaman
            JOIN penyakit ON tanaman.id_tanaman = penyakit.id_tanaman
            JOIN solusi ON penyakit.id_penyakit = solusi.id_penyakit
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to query disease solutions")?;

        Ok(rows)
    }

    async fn list_history(&self) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query_as::<_, HistoryEntry>(HISTORY_QUERY)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query history")?;

        debug!(count = rows.len(), "Fetched history rows");

        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn find_plant_id(&self, plant_name: &str) -> Result<Option<i32>> {
        let id: Option<(i32,)> =
            sqlx::query_as("SELECT id_tanaman FROM tanaman WHERE nama_tanaman = ?")
                .bind(plant_name)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to resolve plant id")?;

        Ok(id.map(|(id,)| id))
    }

    #[instrument(skip(self))]
    async fn find_disease_id(&self, disease_name: &str, plant_id: i32) -> Result<Option<i32>> {
        let id: Option<(i32,)> = sqlx::query_as(
            "SELECT id_penyakit FROM penyakit WHERE nama_penyakit = ? AND id_tanaman = ?",
        )
        .bind(disease_name)
        .bind(plant_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to resolve disease id")?;

        Ok(id.map(|(id,)| id))
    }

    #[instrument(skip(self))]
    async fn find_solution(&self, disease_id: i32) -> Result<Option<Solution>> {
        // Several solutions per disease are possible; the lowest id wins.
        let solution = sqlx::query_as::<_, Solution>(
            r#"
            SELECT id_solusi AS id, desc_solusi AS description
            FROM solusi
            WHERE id_penyakit = ?
            ORDER BY id_solusi
            LIMIT 1
            "#,
        )
        .bind(disease_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to resolve solution")?;

        Ok(solution)
    }

    #[instrument(skip(self, record), fields(history_id = %record.id))]
    async fn insert_history(&self, record: &NewHistoryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO history (
                id_history, tgl_history, id_tanaman, id_penyakit, id_solusi, image
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.date)
        .bind(record.plant_id)
        .bind(record.disease_id)
        .bind(record.solution_id)
        .bind(&record.image_url)
        .execute(&self.pool)
        .await
        .context("Failed to insert history record")?;

        debug!(history_id = %record.id, "History record inserted");
        metrics::counter!("diagnosis.history.inserted").increment(1);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_query_orders_newest_first() {
        assert!(HISTORY_QUERY.contains("ORDER BY h.tgl_history DESC"));
    }

    #[test]
    fn test_plant_serializes_with_column_names() {
        let plant = Plant {
            name: "Tomato".to_string(),
            description: "Solanum lycopersicum".to_string(),
        };

        let json = serde_json::to_value(&plant).unwrap();
        assert_eq!(json["nama_tanaman"], "Tomato");
        assert_eq!(json["desc_tanaman"], "Solanum lycopersicum");
    }

    #[test]
    fn test_disease_solution_serialization() {
        let row = DiseaseSolution {
            plant_name: "Potato".to_string(),
            disease_name: "Late_blight".to_string(),
            solution: "Remove infected leaves".to_string(),
        };

        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["plant_name"], "Potato");
        assert_eq!(json["disease_name"], "Late_blight");
        assert_eq!(json["solution"], "Remove infected leaves");
    }
}

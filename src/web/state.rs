use std::env;

use anyhow::{Context, Result, anyhow};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;
use uuid::Uuid;

use crate::{config::Settings, store::ContentStore, subs::TimedTextClient};

#[derive(Clone)]
pub struct AppState {
    pool: PgPool,
    store: ContentStore,
    settings: Settings,
    timedtext: TimedTextClient,
}

impl AppState {
    pub async fn new() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL env var is missing")?;
        let settings = Settings::from_env().context("failed to load settings")?;

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&database_url)
            .await
            .context("failed to connect to Postgres")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run database migrations")?;

        let timedtext =
            TimedTextClient::new(&settings.timedtext).context("failed to build timed-text client")?;

        Ok(Self {
            store: ContentStore::new(pool.clone()),
            pool,
            settings,
            timedtext,
        })
    }

    /// Seed a staff account on first boot so the instance is reachable.
    pub async fn ensure_seed_staff(&self) -> Result<()> {
        let has_staff: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE is_staff = TRUE)")
                .fetch_one(&self.pool)
                .await
                .context("failed to verify staff presence")?;

        if !has_staff {
            let password_hash = crate::web::auth::hash_password("change-me")
                .map_err(|err| anyhow!("failed to hash seed staff password: {err}"))?;

            sqlx::query(
                "INSERT INTO users (id, username, full_name, password_hash, is_staff) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(Uuid::new_v4())
            .bind("studio-staff")
            .bind("Studio Staff")
            .bind(password_hash)
            .bind(true)
            .execute(&self.pool)
            .await
            .context("failed to insert seed staff user")?;

            info!("Seeded default staff user 'studio-staff' (password: 'change-me'). Update it promptly.");
        }

        Ok(())
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    pub fn pool_ref(&self) -> &PgPool {
        &self.pool
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn timedtext(&self) -> &TimedTextClient {
        &self.timedtext
    }
}

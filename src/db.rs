use anyhow::Result;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres, Row};
use tracing::{debug, info, warn};

use crate::crypto::token_fingerprint;
use crate::error::StoreError;
use crate::models::{NotificationKind, QuietHours, RecipientPreferences};
use crate::settings::SettingsProvider;
use crate::store::{StateStore, Table};

pub async fn init_db_pool(database_url: &str) -> Result<Pool<Postgres>> {
    info!("Initializing database connection pool");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Pipeline state in the `pipeline_state` table, one row per (table, key).
#[derive(Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

impl StateStore for PgStore {
    async fn put(&self, table: Table, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_state (table_name, key, value, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (table_name, key)
            DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(table.as_str())
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, table: Table, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pipeline_state WHERE table_name = $1 AND key = $2")
            .bind(table.as_str())
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn load_all(&self, table: Table) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT key, value
            FROM pipeline_state
            WHERE table_name = $1
            ORDER BY key
            "#,
        )
        .bind(table.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok((row.try_get("key")?, row.try_get("value")?)))
            .collect()
    }
}

/// Reads recipient preferences and devices from the app's own tables.
#[derive(Clone)]
pub struct PgSettingsProvider {
    pool: Pool<Postgres>,
}

impl PgSettingsProvider {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

// Unknown kinds in `disabled_kinds` are ignored; malformed quiet hours disable the window
fn build_preferences(
    quiet_start: Option<String>,
    quiet_end: Option<String>,
    utc_offset_minutes: i32,
    disabled_kinds: &[String],
    fan_out_to_all_tokens: bool,
    device_tokens: Vec<String>,
) -> RecipientPreferences {
    let quiet_hours = match (quiet_start, quiet_end) {
        (Some(start), Some(end)) => {
            let parsed = QuietHours::parse(&start, &end);
            if parsed.is_none() {
                warn!(start = %start, end = %end, "Ignoring malformed quiet hours");
            }
            parsed
        }
        _ => None,
    };

    let mut prefs = RecipientPreferences {
        quiet_hours,
        utc_offset_minutes,
        device_tokens,
        fan_out_to_all_tokens,
        ..Default::default()
    };
    for kind in disabled_kinds.iter().filter_map(|k| NotificationKind::parse(k)) {
        prefs.enabled_kinds.remove(&kind);
    }
    prefs
}

impl SettingsProvider for PgSettingsProvider {
    async fn get_preferences(&self, recipient_id: &str) -> Result<RecipientPreferences, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT quiet_hours_start, quiet_hours_end, utc_offset_minutes,
                   disabled_kinds, fan_out_to_all_tokens
            FROM notification_preferences
            WHERE user_id = $1
            "#,
        )
        .bind(recipient_id)
        .fetch_optional(&self.pool)
        .await?;

        let device_tokens: Vec<String> = sqlx::query(
            r#"
            SELECT device_token
            FROM user_devices
            WHERE user_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(recipient_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| row.try_get("device_token"))
        .collect::<Result<_, _>>()?;

        let prefs = match row {
            Some(row) => build_preferences(
                row.try_get("quiet_hours_start")?,
                row.try_get("quiet_hours_end")?,
                row.try_get("utc_offset_minutes")?,
                &row.try_get::<Vec<String>, _>("disabled_kinds")?,
                row.try_get("fan_out_to_all_tokens")?,
                device_tokens,
            ),
            // No row means every kind is enabled
            None => build_preferences(None, None, 0, &[], false, device_tokens),
        };

        debug!(recipient_id = %recipient_id, devices = prefs.device_tokens.len(), "Loaded preferences");
        Ok(prefs)
    }

    async fn invalidate_token(&self, recipient_id: &str, token: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM user_devices WHERE device_token = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;

        info!(
            recipient_id = %recipient_id,
            token = %token_fingerprint(token),
            removed = result.rows_affected(),
            "Removed invalid device token"
        );
        Ok(())
    }
}

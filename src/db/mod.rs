//! Trade record persistence.
//!
//! The exchange only knows about orders it accepted. The SL/TP a position
//! was meant to carry lives here so protection can be restored after a
//! restart. Decimals are stored as TEXT to keep exact precision.

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{PositionSide, TradeRecord, TradeStatus};

/// Storage the gateway, reconciler and janitor write trade records through.
#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn insert_trade(&self, record: &TradeRecord) -> Result<()>;

    /// Latest PENDING/OPEN/FILLED record for a symbol.
    async fn find_latest_active(&self, symbol: &str) -> Result<Option<TradeRecord>>;

    async fn update_status(&self, id: &str, status: TradeStatus, error_message: Option<&str>) -> Result<()>;

    /// Store what the exchange acknowledged for the entry order.
    async fn record_submission(
        &self,
        id: &str,
        order_id: &str,
        status: TradeStatus,
        entry_price: Decimal,
        sl_price: Decimal,
        tp_price: Decimal,
    ) -> Result<()>;

    /// Returns the number of records updated.
    async fn update_status_by_order_id(&self, order_id: &str, status: TradeStatus) -> Result<u64>;

    /// Mark OPEN/FILLED records of a flat symbol as CLOSED.
    async fn close_active(&self, symbol: &str) -> Result<u64>;

    async fn recent_trades(&self, limit: i64) -> Result<Vec<TradeRecord>>;
}

/// SQLite connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Row shape of the `trades` table.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredTrade {
    id: String,
    symbol: String,
    side: String,
    entry_price: String,
    size: String,
    quantity: String,
    leverage: i64,
    sl_price: String,
    tp_price: String,
    status: String,
    order_id: Option<String>,
    order_type: String,
    error_message: Option<String>,
    created_at: String,
}

impl TryFrom<StoredTrade> for TradeRecord {
    type Error = anyhow::Error;

    fn try_from(row: StoredTrade) -> Result<Self> {
        let dec = |field: &str, v: &str| -> Result<Decimal> {
            Decimal::from_str(v).with_context(|| format!("Bad {} '{}' in trade {}", field, v, row.id))
        };

        Ok(TradeRecord {
            side: PositionSide::from_str(&row.side).map_err(|e| anyhow!(e))?,
            entry_price: dec("entry_price", &row.entry_price)?,
            size: dec("size", &row.size)?,
            quantity: dec("quantity", &row.quantity)?,
            leverage: u32::try_from(row.leverage).context("Bad leverage")?,
            sl_price: dec("sl_price", &row.sl_price)?,
            tp_price: dec("tp_price", &row.tp_price)?,
            status: TradeStatus::from_str(&row.status).map_err(|e| anyhow!(e))?,
            created_at: DateTime::parse_from_rfc3339(&row.created_at)
                .context("Bad created_at")?
                .with_timezone(&Utc),
            id: row.id,
            symbol: row.symbol,
            order_id: row.order_id,
            order_type: row.order_type,
            error_message: row.error_message,
        })
    }
}

fn timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Database {
    /// Create a new database connection, e.g. `sqlite:perpguard.db?mode=rwc`.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database. A single connection, since every
    /// connection to `:memory:` is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                size TEXT NOT NULL,
                quantity TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                sl_price TEXT NOT NULL,
                tp_price TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                order_id TEXT,
                order_type TEXT NOT NULL DEFAULT 'MARKET',
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_symbol_status ON trades(symbol, status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_order_id ON trades(order_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl TradeStore for Database {
    async fn insert_trade(&self, record: &TradeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, symbol, side, entry_price, size, quantity, leverage,
                sl_price, tp_price, status, order_id, order_type, error_message,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.symbol)
        .bind(record.side.as_str())
        .bind(record.entry_price.to_string())
        .bind(record.size.to_string())
        .bind(record.quantity.to_string())
        .bind(i64::from(record.leverage))
        .bind(record.sl_price.to_string())
        .bind(record.tp_price.to_string())
        .bind(record.status.as_str())
        .bind(&record.order_id)
        .bind(&record.order_type)
        .bind(&record.error_message)
        .bind(timestamp(record.created_at))
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .context("Failed to insert trade")?;

        Ok(())
    }

    async fn find_latest_active(&self, symbol: &str) -> Result<Option<TradeRecord>> {
        let row = sqlx::query_as::<_, StoredTrade>(
            r#"
            SELECT id, symbol, side, entry_price, size, quantity, leverage, sl_price, tp_price,
                   status, order_id, order_type, error_message, created_at
            FROM trades
            WHERE symbol = ? AND status IN ('PENDING', 'OPEN', 'FILLED')
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query active trade")?;

        row.map(TradeRecord::try_from).transpose()
    }

    async fn update_status(&self, id: &str, status: TradeStatus, error_message: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trades SET
                status = ?,
                error_message = COALESCE(?, error_message),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(timestamp(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update trade status")?;

        Ok(())
    }

    async fn record_submission(
        &self,
        id: &str,
        order_id: &str,
        status: TradeStatus,
        entry_price: Decimal,
        sl_price: Decimal,
        tp_price: Decimal,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trades SET
                order_id = ?,
                status = ?,
                entry_price = ?,
                sl_price = ?,
                tp_price = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(order_id)
        .bind(status.as_str())
        .bind(entry_price.to_string())
        .bind(sl_price.to_string())
        .bind(tp_price.to_string())
        .bind(timestamp(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to record order submission")?;

        Ok(())
    }

    async fn update_status_by_order_id(&self, order_id: &str, status: TradeStatus) -> Result<u64> {
        let result = sqlx::query("UPDATE trades SET status = ?, updated_at = ? WHERE order_id = ?")
            .bind(status.as_str())
            .bind(timestamp(Utc::now()))
            .bind(order_id)
            .execute(&self.pool)
            .await
            .context("Failed to update trade by order id")?;

        Ok(result.rows_affected())
    }

    async fn close_active(&self, symbol: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE trades SET status = 'CLOSED', updated_at = ? WHERE symbol = ? AND status IN ('OPEN', 'FILLED')",
        )
        .bind(timestamp(Utc::now()))
        .bind(symbol)
        .execute(&self.pool)
        .await
        .context("Failed to close trades")?;

        Ok(result.rows_affected())
    }

    async fn recent_trades(&self, limit: i64) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query_as::<_, StoredTrade>(
            r#"
            SELECT id, symbol, side, entry_price, size, quantity, leverage, sl_price, tp_price,
                   status, order_id, order_type, error_message, created_at
            FROM trades
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch trades")?;

        rows.into_iter().map(TradeRecord::try_from).collect()
    }
}

//! Persistence of orders in a single SQLite table.
//!
//! The pool is owned by [`OrderStore`] and handed to whoever needs it; there is
//! no process-wide connection. Each upsert runs in its own transaction, and a
//! batch import shares one transaction so a bad record leaves the table as it
//! was.

use std::str::FromStr;

use log::{debug, info, warn};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::{Result, TombolaError};
use crate::order::{NewOrder, Order, non_blank, validate_quantity};

const CREATE_ORDERS: &str = "
    CREATE TABLE IF NOT EXISTS orders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        date TEXT NOT NULL,
        firm TEXT,
        name TEXT NOT NULL,
        email TEXT NOT NULL DEFAULT '',
        num_tickets INTEGER NOT NULL,
        achat TEXT,
        notified_at TEXT,
        UNIQUE(name, date)
    )";

const ORDER_COLUMNS: &str = "id, date, firm, name, email, num_tickets, achat, notified_at";

/// Whether an upsert created a row or refreshed an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub inserted: usize,
    pub updated: usize,
}

impl ImportSummary {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }

    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
        }
    }
}

#[derive(Clone)]
pub struct OrderStore {
    pool: SqlitePool,
}

impl OrderStore {
    /// Open a pool on `database_url`, creating the database file if needed.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        debug!("Connected to {}", database_url);
        Ok(OrderStore { pool })
    }

    /// A private in-memory database, already migrated.
    ///
    /// Every SQLite memory connection is its own database, so the pool is
    /// pinned to a single connection that never expires.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = OrderStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        OrderStore { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the `orders` table, and add columns that older databases lack.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_ORDERS).execute(&self.pool).await?;

        let columns: Vec<(String,)> = sqlx::query_as("SELECT name FROM pragma_table_info('orders')")
            .fetch_all(&self.pool)
            .await?;
        for column in ["achat", "notified_at"] {
            if !columns.iter().any(|(name,)| name == column) {
                info!("Adding missing column orders.{}", column);
                sqlx::query(&format!("ALTER TABLE orders ADD COLUMN {} TEXT", column))
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    /// Insert `order`, or refresh the row that has the same name and date.
    ///
    /// A re-import that carries no purchase type keeps the one the operator
    /// already typed in.
    pub async fn upsert(&self, order: NewOrder) -> Result<UpsertOutcome> {
        let order = order.normalized()?;
        let mut tx = self.pool.begin().await?;
        let outcome = upsert_in(&mut tx, &order).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Upsert a whole import in one transaction.
    ///
    /// Every record is validated before anything is written. New rows are
    /// inserted by date then name, so they take the next ticket numbers in
    /// that order whatever the row order of the export.
    pub async fn upsert_all(&self, orders: Vec<NewOrder>) -> Result<ImportSummary> {
        let mut orders = orders
            .into_iter()
            .map(NewOrder::normalized)
            .collect::<Result<Vec<_>>>()?;
        orders.sort_by(|a, b| (&a.date, &a.name).cmp(&(&b.date, &b.name)));

        let mut summary = ImportSummary::default();
        let mut tx = self.pool.begin().await?;
        for order in &orders {
            summary.record(upsert_in(&mut tx, order).await?);
        }
        tx.commit().await?;

        info!(
            "Imported {} order(s): {} new, {} updated",
            summary.total(),
            summary.inserted,
            summary.updated
        );
        Ok(summary)
    }

    /// All orders in insertion order. Ticket numbering follows this order,
    /// so a new order never moves the numbers of the ones before it.
    pub async fn list_all(&self) -> Result<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders ORDER BY id ASC",
            ORDER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(orders)
    }

    pub async fn find(&self, name: &str, date: &str) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE name = ? AND date = ?",
            ORDER_COLUMNS
        ))
        .bind(name)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(order)
    }

    pub async fn get(&self, name: &str, date: &str) -> Result<Order> {
        self.find(name, date)
            .await?
            .ok_or_else(|| not_found(name, date))
    }

    /// Set or clear (blank value) the purchase type of one order.
    pub async fn update_achat(&self, name: &str, date: &str, achat: Option<String>) -> Result<()> {
        let result = sqlx::query("UPDATE orders SET achat = ? WHERE name = ? AND date = ?")
            .bind(non_blank(achat))
            .bind(name)
            .bind(date)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(not_found(name, date));
        }
        Ok(())
    }

    /// Change the ticket count of one order.
    ///
    /// Refused once this order, or any order after it, has been emailed its
    /// numbers: the change would move tickets a buyer already knows.
    pub async fn update_quantity(&self, name: &str, date: &str, num_tickets: i64) -> Result<()> {
        validate_quantity(num_tickets)?;
        let mut tx = self.pool.begin().await?;
        let (id, current): (i64, i64) =
            sqlx::query_as("SELECT id, num_tickets FROM orders WHERE name = ? AND date = ?")
                .bind(name)
                .bind(date)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| not_found(name, date))?;
        if current == num_tickets {
            return Ok(());
        }
        if numbers_frozen(&mut tx, id).await? {
            return Err(TombolaError::validation(format!(
                "tickets have already been emailed for {} or a later order; its quantity can no longer change",
                name
            )));
        }

        sqlx::query("UPDATE orders SET num_tickets = ? WHERE id = ?")
            .bind(num_tickets)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Stamp the order as emailed. Resending refreshes the stamp.
    pub async fn mark_notified(&self, name: &str, date: &str) -> Result<()> {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let result = sqlx::query("UPDATE orders SET notified_at = ? WHERE name = ? AND date = ?")
            .bind(now)
            .bind(name)
            .bind(date)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(not_found(name, date));
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn upsert_in(conn: &mut SqliteConnection, order: &NewOrder) -> Result<UpsertOutcome> {
    let existing: Option<(i64, i64)> =
        sqlx::query_as("SELECT id, num_tickets FROM orders WHERE name = ? AND date = ?")
            .bind(&order.name)
            .bind(&order.date)
            .fetch_optional(&mut *conn)
            .await?;

    let mut num_tickets = order.num_tickets;
    if let Some((id, stored)) = existing {
        if stored != num_tickets && numbers_frozen(conn, id).await? {
            warn!(
                "Order of {} on {}: keeping {} ticket(s) instead of {}, numbers were already emailed",
                order.name, order.date, stored, num_tickets
            );
            num_tickets = stored;
        }
    }

    sqlx::query(
        "INSERT INTO orders (date, firm, name, email, num_tickets, achat)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(name, date) DO UPDATE SET
            firm = excluded.firm,
            email = excluded.email,
            num_tickets = excluded.num_tickets,
            achat = COALESCE(excluded.achat, orders.achat)",
    )
    .bind(&order.date)
    .bind(&order.firm)
    .bind(&order.name)
    .bind(&order.email)
    .bind(num_tickets)
    .bind(&order.achat)
    .execute(&mut *conn)
    .await?;

    let outcome = if existing.is_some() {
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Inserted
    };
    debug!("{:?} order {} / {}", outcome, order.name, order.date);
    Ok(outcome)
}

/// True when the order `id`, or one inserted after it, has been emailed.
async fn numbers_frozen(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
    let (frozen,): (i64,) = sqlx::query_as(
        "SELECT EXISTS(SELECT 1 FROM orders WHERE id >= ? AND notified_at IS NOT NULL)",
    )
    .bind(id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(frozen != 0)
}

fn not_found(name: &str, date: &str) -> TombolaError {
    TombolaError::NotFound {
        name: name.to_string(),
        date: date.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tickets::{expand, total_tickets};

    #[tokio::test]
    async fn upsert_inserts_then_updates_same_name_and_date() {
        let store = OrderStore::in_memory().await.unwrap();

        let first = store
            .upsert(NewOrder::new("Alice", "2024-01-01", "alice@example.org", 2))
            .await
            .unwrap();
        store
            .upsert(NewOrder::new("Bob", "2024-01-01", "bob@example.org", 3))
            .await
            .unwrap();
        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(total_tickets(&store.list_all().await.unwrap()), 5);

        let again = store
            .upsert(NewOrder::new("Alice", "2024-01-01", "alice@example.org", 5))
            .await
            .unwrap();
        assert_eq!(again, UpsertOutcome::Updated);

        let orders = store.list_all().await.unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders.iter().filter(|o| o.name == "Alice").count(), 1);
        assert_eq!(orders[0].num_tickets, 5);
        assert_eq!(expand(&orders).count(), 8);
    }

    #[tokio::test]
    async fn upsert_rejects_invalid_orders_without_writing() {
        let store = OrderStore::in_memory().await.unwrap();

        let err = store
            .upsert(NewOrder::new("Alice", "2024-01-01", "", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, TombolaError::Validation(_)));

        let err = store
            .upsert(NewOrder::new("", "2024-01-01", "", 2))
            .await
            .unwrap_err();
        assert!(matches!(err, TombolaError::Validation(_)));

        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reimport_keeps_operator_achat_unless_given() {
        let store = OrderStore::in_memory().await.unwrap();
        store
            .upsert(NewOrder::new("Alice", "2024-01-01", "a@example.org", 1))
            .await
            .unwrap();
        store
            .update_achat("Alice", "2024-01-01", Some("Virement".to_string()))
            .await
            .unwrap();

        store
            .upsert(NewOrder::new("Alice", "2024-01-01", "new@example.org", 4))
            .await
            .unwrap();
        let alice = store.get("Alice", "2024-01-01").await.unwrap();
        assert_eq!(alice.achat.as_deref(), Some("Virement"));
        assert_eq!(alice.email, "new@example.org");
        assert_eq!(alice.num_tickets, 4);

        store
            .upsert(NewOrder::new("Alice", "2024-01-01", "new@example.org", 4).with_achat("Espèces"))
            .await
            .unwrap();
        let alice = store.get("Alice", "2024-01-01").await.unwrap();
        assert_eq!(alice.achat.as_deref(), Some("Espèces"));
    }

    #[tokio::test]
    async fn list_all_follows_insertion_order() {
        let store = OrderStore::in_memory().await.unwrap();
        for (name, date) in [
            ("Zoe", "2024-01-02 09:00:00"),
            ("Bob", "2024-01-01 12:00:00"),
            ("Alice", "2024-01-01 12:00:00"),
        ] {
            store.upsert(NewOrder::new(name, date, "", 1)).await.unwrap();
        }

        let names: Vec<String> = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.name)
            .collect();
        assert_eq!(names, vec!["Zoe", "Bob", "Alice"]);
    }

    #[tokio::test]
    async fn upsert_all_inserts_new_rows_by_date_then_name() {
        let store = OrderStore::in_memory().await.unwrap();
        store
            .upsert(NewOrder::new("Zoe", "2024-02-01 09:00:00", "", 1))
            .await
            .unwrap();

        let batch = vec![
            NewOrder::new("Carol", "2024-01-03 09:00:00", "", 1),
            NewOrder::new("Bob", "2024-01-01 12:00:00", "", 1),
            NewOrder::new("Alice", "2024-01-01 12:00:00", "", 1),
        ];
        store.upsert_all(batch).await.unwrap();

        let names: Vec<String> = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.name)
            .collect();
        assert_eq!(names, vec!["Zoe", "Alice", "Bob", "Carol"]);
    }

    #[tokio::test]
    async fn emailed_numbers_freeze_quantities_up_to_that_order() {
        let store = OrderStore::in_memory().await.unwrap();
        for (name, n) in [("Alice", 2), ("Bob", 3), ("Carol", 1)] {
            store
                .upsert(NewOrder::new(name, "2024-01-01", "", n))
                .await
                .unwrap();
        }
        store.mark_notified("Bob", "2024-01-01").await.unwrap();

        let err = store
            .update_quantity("Bob", "2024-01-01", 4)
            .await
            .unwrap_err();
        assert!(matches!(err, TombolaError::Validation(_)));
        assert!(store.update_quantity("Alice", "2024-01-01", 5).await.is_err());
        store.update_quantity("Bob", "2024-01-01", 3).await.unwrap();
        store.update_quantity("Carol", "2024-01-01", 4).await.unwrap();

        store
            .upsert(NewOrder::new("Alice", "2024-01-01", "alice@example.org", 9))
            .await
            .unwrap();
        let alice = store.get("Alice", "2024-01-01").await.unwrap();
        assert_eq!(alice.num_tickets, 2);
        assert_eq!(alice.email, "alice@example.org");

        let orders = store.list_all().await.unwrap();
        let bob: Vec<u64> = expand(&orders)
            .filter(|t| t.order.name == "Bob")
            .map(|t| t.ticket_id)
            .collect();
        assert_eq!(bob, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn upsert_all_is_all_or_nothing() {
        let store = OrderStore::in_memory().await.unwrap();
        let batch = vec![
            NewOrder::new("Alice", "2024-01-01", "", 2),
            NewOrder::new("Bob", "2024-01-01", "", -1),
        ];
        assert!(store.upsert_all(batch).await.is_err());
        assert!(store.list_all().await.unwrap().is_empty());

        let batch = vec![
            NewOrder::new("Alice", "2024-01-01", "", 2),
            NewOrder::new("Bob", "2024-01-01", "", 3),
        ];
        let summary = store.upsert_all(batch).await.unwrap();
        assert_eq!(summary, ImportSummary { inserted: 2, updated: 0 });

        let batch = vec![
            NewOrder::new("Alice", "2024-01-01", "", 5),
            NewOrder::new("Carol", "2024-01-03", "", 1),
        ];
        let summary = store.upsert_all(batch).await.unwrap();
        assert_eq!(summary, ImportSummary { inserted: 1, updated: 1 });
        assert_eq!(store.list_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn edits_report_unknown_orders() {
        let store = OrderStore::in_memory().await.unwrap();
        let err = store
            .update_achat("Nobody", "2024-01-01", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TombolaError::NotFound { .. }));

        let err = store.mark_notified("Nobody", "2024-01-01").await.unwrap_err();
        assert!(matches!(err, TombolaError::NotFound { .. }));
    }

    #[tokio::test]
    async fn update_quantity_validates_and_persists() {
        let store = OrderStore::in_memory().await.unwrap();
        store
            .upsert(NewOrder::new("Alice", "2024-01-01", "", 2))
            .await
            .unwrap();

        assert!(store.update_quantity("Alice", "2024-01-01", 0).await.is_err());
        store.update_quantity("Alice", "2024-01-01", 7).await.unwrap();
        assert_eq!(store.get("Alice", "2024-01-01").await.unwrap().num_tickets, 7);
    }

    #[tokio::test]
    async fn mark_notified_sets_timestamp() {
        let store = OrderStore::in_memory().await.unwrap();
        store
            .upsert(NewOrder::new("Alice", "2024-01-01", "", 2))
            .await
            .unwrap();
        assert!(!store.get("Alice", "2024-01-01").await.unwrap().is_notified());

        store.mark_notified("Alice", "2024-01-01").await.unwrap();
        assert!(store.get("Alice", "2024-01-01").await.unwrap().is_notified());
    }

    #[tokio::test]
    async fn migrate_adds_columns_to_older_tables() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL,
                firm TEXT,
                name TEXT NOT NULL,
                email TEXT NOT NULL,
                num_tickets INTEGER NOT NULL,
                UNIQUE(name, date)
            )",
        )
        .execute(&pool)
        .await
        .unwrap();

        let store = OrderStore::from_pool(pool);
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();

        store
            .upsert(NewOrder::new("Alice", "2024-01-01", "", 1).with_achat("Chèque"))
            .await
            .unwrap();
        let alice = store.get("Alice", "2024-01-01").await.unwrap();
        assert_eq!(alice.achat.as_deref(), Some("Chèque"));
    }

    #[tokio::test]
    async fn file_database_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("tombola.db").display());

        let store = OrderStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        store
            .upsert(NewOrder::new("Alice", "2024-01-01", "alice@example.org", 2))
            .await
            .unwrap();
        store.close().await;

        let store = OrderStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        let orders = store.list_all().await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].num_tickets, 2);
        store.close().await;
    }
}

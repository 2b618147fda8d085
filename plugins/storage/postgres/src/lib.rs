use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, Row};

use courier_api::{BoxFuture, Message, StorageError, now_ms};
use courier_batch::{BatchStore, PendingOp, validate_identifier};

const SQL_CREATE: &str = include_str!("../sql/create_messages.sql");

// ════════════════════════════════════════════════════════════════
//  Config
// ════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PostgresConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_dbname")]
    pub dbname: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: String::new(),
            dbname: default_dbname(),
            table: default_table(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_host() -> String {
    "localhost".into()
}
fn default_port() -> u16 {
    5432
}
fn default_user() -> String {
    "postgres".into()
}
fn default_dbname() -> String {
    "broker".into()
}
fn default_table() -> String {
    "messages".into()
}
fn default_connect_timeout_secs() -> u64 {
    10
}

// ════════════════════════════════════════════════════════════════
//  SQL
// ════════════════════════════════════════════════════════════════

const COLUMNS: &str = "id, subject, body, time_to_live, added_at, removed";

fn create_sql(table: &str) -> String {
    let index = format!("{}_live_idx", table.replace('.', "_"));
    SQL_CREATE.replace("{table}", table).replace("{index}", &index)
}

/// Whole insert half of a batch as one statement over parallel arrays.
/// Conflicts are ignored so a retried batch is harmless.
fn insert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} ({COLUMNS}) \
         SELECT * FROM UNNEST($1::BIGINT[], $2::TEXT[], $3::BYTEA[], $4::BIGINT[], $5::BIGINT[], $6::BOOLEAN[]) \
         ON CONFLICT (subject, id) DO NOTHING"
    )
}

fn remove_sql(table: &str) -> String {
    format!(
        "UPDATE {table} AS m SET removed = TRUE \
         FROM UNNEST($1::TEXT[], $2::BIGINT[]) AS r(subject, id) \
         WHERE m.subject = r.subject AND m.id = r.id"
    )
}

fn fetch_sql(table: &str) -> String {
    format!("SELECT {COLUMNS} FROM {table} WHERE subject = $1 AND id = $2")
}

fn by_subject_sql(table: &str) -> String {
    format!("SELECT {COLUMNS} FROM {table} WHERE subject = $1 AND NOT removed ORDER BY id")
}

fn mark_overdue_sql(table: &str) -> String {
    format!(
        "UPDATE {table} SET removed = TRUE \
         WHERE NOT removed AND time_to_live > 0 AND time_to_live <= $1 - added_at"
    )
}

fn pg_id(id: u64) -> Result<i64, StorageError> {
    i64::try_from(id).map_err(|_| StorageError::format(format!("id {id} exceeds BIGINT")))
}

/// TTLs past `BIGINT` are stored as `i64::MAX`, which never comes due.
fn pg_ttl(message: &Message) -> i64 {
    i64::try_from(message.time_to_live_ms()).unwrap_or(i64::MAX)
}

fn pg_err(context: &str) -> impl Fn(tokio_postgres::Error) -> StorageError + '_ {
    move |e| StorageError::io(format!("PG {context}: {e}"))
}

fn row_to_message(row: &Row) -> Result<Message, StorageError> {
    let get_err = |e: tokio_postgres::Error| StorageError::format(format!("PG row: {e}"));
    let id: i64 = row.try_get("id").map_err(get_err)?;
    let time_to_live: i64 = row.try_get("time_to_live").map_err(get_err)?;
    let body: Vec<u8> = row.try_get("body").map_err(get_err)?;
    Ok(Message {
        id: id as u64,
        subject: row.try_get("subject").map_err(get_err)?,
        body: body.into(),
        time_to_live: Duration::from_millis(time_to_live.max(0) as u64),
        created_at_ms: row.try_get("added_at").map_err(get_err)?,
        removed: row.try_get("removed").map_err(get_err)?,
    })
}

// ════════════════════════════════════════════════════════════════
//  Connection
// ════════════════════════════════════════════════════════════════

/// Holds the current connection and replaces it once it reports closed.
/// Callers queue on the lock, so a dropped connection is re-opened once.
struct Reconnecting<C> {
    current: AsyncMutex<Option<C>>,
}

impl<C: Clone> Reconnecting<C> {
    fn new(initial: C) -> Self {
        Self {
            current: AsyncMutex::new(Some(initial)),
        }
    }

    async fn get<F, Fut>(&self, is_closed: impl Fn(&C) -> bool, connect: F) -> Result<C, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, StorageError>>,
    {
        let mut current = self.current.lock().await;
        if let Some(conn) = current.as_ref().filter(|c| !is_closed(*c)) {
            return Ok(conn.clone());
        }
        let fresh = connect().await?;
        *current = Some(fresh.clone());
        Ok(fresh)
    }

    async fn take(&self) -> Option<C> {
        self.current.lock().await.take()
    }
}

struct Connection {
    client: Client,
    task: JoinHandle<()>,
}

async fn open(pg: &tokio_postgres::Config) -> Result<Arc<Connection>, StorageError> {
    let (client, connection) = pg.connect(NoTls).await.map_err(pg_err("connect"))?;
    let task = tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "postgres connection failed");
        }
    });
    Ok(Arc::new(Connection { client, task }))
}

// ════════════════════════════════════════════════════════════════
//  PostgresStore
// ════════════════════════════════════════════════════════════════

/// Relational message store. A flush runs at most two statements: one
/// multi-row insert and one bulk removal update.
///
/// A connection lost to the server is re-opened on the next statement;
/// the failed batch itself is retried by the batching layer.
pub struct PostgresStore {
    pg: tokio_postgres::Config,
    table: String,
    conn: Reconnecting<Arc<Connection>>,
    closed: AtomicBool,
}

impl PostgresStore {
    pub async fn connect(cfg: &PostgresConfig) -> Result<Self, StorageError> {
        validate_identifier(&cfg.table, "postgres table")?;

        let mut pg = tokio_postgres::Config::new();
        pg.host(&cfg.host)
            .port(cfg.port)
            .user(&cfg.user)
            .password(&cfg.password)
            .dbname(&cfg.dbname)
            .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs));

        let conn = open(&pg).await?;
        tracing::info!(host = %cfg.host, port = cfg.port, dbname = %cfg.dbname, "connected to postgres");

        Ok(Self {
            pg,
            table: cfg.table.clone(),
            conn: Reconnecting::new(conn),
            closed: AtomicBool::new(false),
        })
    }

    async fn connection(&self) -> Result<Arc<Connection>, StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::closed("postgres store is closed"));
        }
        self.conn
            .get(
                |c| c.client.is_closed(),
                || async {
                    tracing::warn!(table = %self.table, "postgres connection lost, reconnecting");
                    open(&self.pg).await
                },
            )
            .await
    }
}

impl BatchStore for PostgresStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn init(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async {
            let conn = self.connection().await?;
            conn.client
                .batch_execute(&create_sql(&self.table))
                .await
                .map_err(pg_err("create table"))?;
            let marked = conn
                .client
                .execute(&mark_overdue_sql(&self.table), &[&now_ms()])
                .await
                .map_err(pg_err("mark overdue"))?;
            tracing::info!(table = %self.table, expired = marked, "postgres messages table ready");
            Ok(())
        })
    }

    fn last_id(&self) -> BoxFuture<'_, Result<u64, StorageError>> {
        Box::pin(async {
            let sql = format!("SELECT COALESCE(MAX(id), 0)::BIGINT AS last_id FROM {}", self.table);
            let conn = self.connection().await?;
            let row = conn.client.query_one(&sql, &[]).await.map_err(pg_err("last id"))?;
            let last: i64 = row
                .try_get("last_id")
                .map_err(|e| StorageError::format(format!("PG row: {e}")))?;
            Ok(last.max(0) as u64)
        })
    }

    fn execute<'a>(&'a self, ops: &'a [PendingOp]) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let mut ids = Vec::new();
            let mut subjects: Vec<&str> = Vec::new();
            let mut bodies: Vec<&[u8]> = Vec::new();
            let mut ttls = Vec::new();
            let mut added = Vec::new();
            let mut removed = Vec::new();
            let mut removal_subjects: Vec<&str> = Vec::new();
            let mut removal_ids = Vec::new();

            for op in ops {
                match op {
                    PendingOp::Insert(m) => {
                        ids.push(pg_id(m.id)?);
                        subjects.push(&m.subject);
                        bodies.push(&m.body);
                        ttls.push(pg_ttl(m));
                        added.push(m.created_at_ms);
                        removed.push(m.removed);
                    }
                    PendingOp::Remove { subject, id } => {
                        removal_subjects.push(subject);
                        removal_ids.push(pg_id(*id)?);
                    }
                }
            }

            let conn = self.connection().await?;
            // Inserts first: a removal may target a row from this same batch.
            if !ids.is_empty() {
                conn.client
                    .execute(
                        &insert_sql(&self.table),
                        &[&ids, &subjects, &bodies, &ttls, &added, &removed],
                    )
                    .await
                    .map_err(pg_err("insert batch"))?;
            }
            if !removal_ids.is_empty() {
                conn.client
                    .execute(&remove_sql(&self.table), &[&removal_subjects, &removal_ids])
                    .await
                    .map_err(pg_err("remove batch"))?;
            }
            Ok(())
        })
    }

    fn fetch(&self, subject: &str, id: u64) -> BoxFuture<'_, Result<Option<Message>, StorageError>> {
        let subject = subject.to_string();
        Box::pin(async move {
            let row = self
                .connection()
                .await?
                .client
                .query_opt(&fetch_sql(&self.table), &[&subject, &pg_id(id)?])
                .await
                .map_err(pg_err("fetch"))?;
            row.as_ref().map(row_to_message).transpose()
        })
    }

    fn by_subject(&self, subject: &str) -> BoxFuture<'_, Result<Vec<Message>, StorageError>> {
        let subject = subject.to_string();
        Box::pin(async move {
            let rows = self
                .connection()
                .await?
                .client
                .query(&by_subject_sql(&self.table), &[&subject])
                .await
                .map_err(pg_err("messages by subject"))?;
            rows.iter().map(row_to_message).collect()
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async {
            self.closed.store(true, Ordering::Release);
            if let Some(conn) = self.conn.take().await {
                conn.task.abort();
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn create_sql_names_index_after_table() {
        let sql = create_sql("broker.messages");
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS broker.messages"));
        assert!(sql.contains("broker_messages_live_idx ON broker.messages"));
        assert!(!sql.contains('{'));
    }

    #[test]
    fn batch_statements_are_idempotent() {
        let insert = insert_sql("messages");
        assert!(insert.contains("UNNEST"));
        assert!(insert.contains("ON CONFLICT (subject, id) DO NOTHING"));

        let remove = remove_sql("messages");
        assert!(remove.contains("SET removed = TRUE"));
        assert!(remove.contains("m.subject = r.subject AND m.id = r.id"));
    }

    #[test]
    fn reads_are_parameterized() {
        assert!(fetch_sql("messages").ends_with("WHERE subject = $1 AND id = $2"));
        let backlog = by_subject_sql("messages");
        assert!(backlog.contains("NOT removed"));
        assert!(backlog.ends_with("ORDER BY id"));
        assert!(mark_overdue_sql("messages").contains("time_to_live <= $1 - added_at"));
    }

    #[test]
    fn ids_beyond_bigint_are_rejected() {
        assert_eq!(pg_id(42).unwrap(), 42);
        assert!(pg_id(u64::MAX).is_err());
    }

    #[test]
    fn ttl_beyond_bigint_is_clamped() {
        use courier_api::Publication;

        let short = Message::new(1, "orders", Publication::new("a").with_ttl_secs(2), 0);
        assert_eq!(pg_ttl(&short), 2_000);
        let huge = Message::new(
            2,
            "orders",
            Publication::new("b").with_ttl_secs(10_000_000_000_000_000),
            0,
        );
        assert_eq!(pg_ttl(&huge), i64::MAX);
    }

    fn flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    fn is_closed(c: &Arc<AtomicBool>) -> bool {
        c.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn open_connection_is_reused() {
        let initial = flag();
        let holder = Reconnecting::new(initial.clone());
        let connects = AtomicUsize::new(0);

        for _ in 0..3 {
            let conn = holder
                .get(is_closed, || async {
                    connects.fetch_add(1, Ordering::SeqCst);
                    Ok(flag())
                })
                .await
                .unwrap();
            assert!(Arc::ptr_eq(&conn, &initial));
        }
        assert_eq!(connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn closed_connection_is_replaced_once() {
        let initial = flag();
        let holder = Reconnecting::new(initial.clone());
        let connects = AtomicUsize::new(0);
        initial.store(true, Ordering::SeqCst);

        let first = holder
            .get(is_closed, || async {
                connects.fetch_add(1, Ordering::SeqCst);
                Ok(flag())
            })
            .await
            .unwrap();
        let second = holder
            .get(is_closed, || async {
                connects.fetch_add(1, Ordering::SeqCst);
                Ok(flag())
            })
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&first, &initial));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_reconnect_is_retried_on_next_use() {
        let initial = flag();
        let holder = Reconnecting::new(initial.clone());
        initial.store(true, Ordering::SeqCst);

        let err = holder
            .get(is_closed, || async { Err(StorageError::io("PG connect: refused")) })
            .await
            .unwrap_err();
        assert!(err.message.contains("refused"));

        let fresh = flag();
        let conn = holder
            .get(is_closed, || async { Ok(fresh.clone()) })
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&conn, &fresh));

        assert!(holder.take().await.is_some());
        assert!(holder.take().await.is_none());
    }

    #[test]
    fn config_defaults_apply() {
        let cfg: PostgresConfig = serde_json::from_str(r#"{"password":"secret"}"#).unwrap();
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.port, 5432);
        assert_eq!(cfg.dbname, "broker");
        assert_eq!(cfg.table, "messages");
        assert_eq!(cfg.password, "secret");
    }
}

use std::time::Duration;

use base64::Engine;

use courier_api::{BoxFuture, Message, StorageError, now_ms};
use courier_batch::{BatchStore, PendingOp, validate_identifier};

const SQL_CREATE: &str = include_str!("../sql/create_messages.sql");

/// Escape a string value for safe use inside a ClickHouse single-quoted literal.
/// Prevents SQL injection by escaping `\` and `'`.
fn escape_ch_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Bodies are arbitrary bytes; the `body` column is a base64 String.
fn encode_body(body: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(body)
}

fn decode_body(body: &str) -> Result<Vec<u8>, StorageError> {
    base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| StorageError::format(format!("base64 decode: {e}")))
}

// ════════════════════════════════════════════════════════════════
//  Config
// ════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ClickHouseConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: String::new(),
            database: default_database(),
            table: default_table(),
            tls: false,
            accept_invalid_certs: false,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_host() -> String {
    "localhost".into()
}
fn default_port() -> u16 {
    8123
}
fn default_user() -> String {
    "default".into()
}
fn default_database() -> String {
    "default".into()
}
fn default_table() -> String {
    "messages".into()
}
fn default_request_timeout_secs() -> u64 {
    30
}

// ════════════════════════════════════════════════════════════════
//  Rows
// ════════════════════════════════════════════════════════════════

/// One `messages` row as exchanged in `FORMAT JSONEachRow`.
///
/// A removal is written as a fresh row with `removed = 1`; the table's
/// `ReplacingMergeTree(removed)` keeps it over the original on merge and
/// `FINAL` reads see only the winner.
#[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
struct ChRow {
    subject: String,
    id: u64,
    body: String,
    time_to_live: u64,
    added_at: i64,
    removed: u8,
}

impl ChRow {
    fn from_op(op: &PendingOp) -> Self {
        match op {
            PendingOp::Insert(m) => ChRow {
                subject: m.subject.clone(),
                id: m.id,
                body: encode_body(&m.body),
                time_to_live: m.time_to_live_ms(),
                added_at: m.created_at_ms,
                removed: u8::from(m.removed),
            },
            PendingOp::Remove { subject, id } => ChRow {
                subject: subject.clone(),
                id: *id,
                body: String::new(),
                time_to_live: 0,
                added_at: 0,
                removed: 1,
            },
        }
    }

    fn into_message(self) -> Result<Message, StorageError> {
        Ok(Message {
            id: self.id,
            subject: self.subject,
            body: decode_body(&self.body)?.into(),
            time_to_live: Duration::from_millis(self.time_to_live),
            created_at_ms: self.added_at,
            removed: self.removed != 0,
        })
    }
}

fn render_rows(ops: &[PendingOp]) -> Result<String, StorageError> {
    let mut body = String::new();
    for op in ops {
        body.push_str(&serde_json::to_string(&ChRow::from_op(op))?);
        body.push('\n');
    }
    Ok(body)
}

fn parse_rows(body: &str) -> Result<Vec<Message>, StorageError> {
    body.lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let row: ChRow = serde_json::from_str(line)
                .map_err(|e| StorageError::format(format!("parse CH row: {e}")))?;
            row.into_message()
        })
        .collect()
}

const SELECT_COLUMNS: &str = "subject, id, body, time_to_live, added_at, removed";

fn fetch_sql(table: &str, subject: &str, id: u64) -> String {
    format!(
        "SELECT {SELECT_COLUMNS} FROM {table} FINAL \
         WHERE subject = '{}' AND id = {id} \
         FORMAT JSONEachRow",
        escape_ch_string(subject),
    )
}

fn by_subject_sql(table: &str, subject: &str) -> String {
    format!(
        "SELECT {SELECT_COLUMNS} FROM {table} FINAL \
         WHERE subject = '{}' AND removed = 0 \
         ORDER BY id \
         FORMAT JSONEachRow",
        escape_ch_string(subject),
    )
}

/// Re-insert overdue live rows as removals.
fn mark_overdue_sql(table: &str, now_ms: i64) -> String {
    format!(
        "INSERT INTO {table} ({SELECT_COLUMNS}) \
         SELECT subject, id, '', 0, 0, 1 FROM {table} FINAL \
         WHERE removed = 0 AND time_to_live > 0 \
         AND added_at <= {now_ms} AND time_to_live <= toUInt64({now_ms} - added_at)"
    )
}

// ════════════════════════════════════════════════════════════════
//  ClickHouseStore
// ════════════════════════════════════════════════════════════════

/// Wide-column message store on ClickHouse, spoken to over its HTTP
/// interface. Every flush is a single `INSERT ... FORMAT JSONEachRow`.
pub struct ClickHouseStore {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    database: String,
    table: String,
}

impl ClickHouseStore {
    pub fn new(cfg: &ClickHouseConfig) -> Result<Self, StorageError> {
        validate_identifier(&cfg.table, "clickhouse table")?;
        let scheme = if cfg.tls { "https" } else { "http" };
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(cfg.accept_invalid_certs)
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| StorageError::config(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: format!("{scheme}://{}:{}", cfg.host, cfg.port),
            user: cfg.user.clone(),
            password: cfg.password.clone(),
            database: cfg.database.clone(),
            table: cfg.table.clone(),
        })
    }

    /// Execute a SQL statement (DDL / SELECT). Body = SQL text.
    async fn exec(&self, sql: &str) -> Result<String, StorageError> {
        let resp = self
            .http
            .post(&self.base_url)
            .query(&[
                ("user", self.user.as_str()),
                ("password", self.password.as_str()),
                ("database", self.database.as_str()),
                ("output_format_json_quote_64bit_integers", "0"),
            ])
            .body(sql.to_owned())
            .send()
            .await
            .map_err(|e| StorageError::io(format!("CH request: {e}")))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| StorageError::io(format!("CH read: {e}")))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(StorageError::io(body))
        }
    }

    /// Execute an INSERT using FORMAT JSONEachRow.
    /// The INSERT statement goes in the `query` URL parameter;
    /// the NDJSON body goes as the POST body.
    async fn exec_insert(&self, ndjson_body: String) -> Result<(), StorageError> {
        let insert_sql = format!("INSERT INTO {} ({SELECT_COLUMNS}) FORMAT JSONEachRow", self.table);
        let resp = self
            .http
            .post(&self.base_url)
            .query(&[
                ("user", self.user.as_str()),
                ("password", self.password.as_str()),
                ("database", self.database.as_str()),
                ("query", insert_sql.as_str()),
            ])
            .body(ndjson_body)
            .send()
            .await
            .map_err(|e| StorageError::io(format!("CH insert: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.map_err(|e| StorageError::io(format!("CH read: {e}")))?;
            Err(StorageError::io(body))
        }
    }
}

#[derive(serde::Deserialize)]
struct LastIdRow {
    last_id: u64,
}

impl BatchStore for ClickHouseStore {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    fn init(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async {
            let sql = SQL_CREATE.replace("{table}", &self.table);
            self.exec(&sql).await?;
            self.exec(&mark_overdue_sql(&self.table, now_ms())).await?;
            tracing::info!(table = %self.table, "clickhouse messages table ready");
            Ok(())
        })
    }

    fn last_id(&self) -> BoxFuture<'_, Result<u64, StorageError>> {
        Box::pin(async {
            let sql = format!("SELECT max(id) AS last_id FROM {} FORMAT JSONEachRow", self.table);
            let body = self.exec(&sql).await?;
            match body.lines().find(|l| !l.is_empty()) {
                Some(line) => Ok(serde_json::from_str::<LastIdRow>(line)?.last_id),
                None => Ok(0),
            }
        })
    }

    fn execute<'a>(&'a self, ops: &'a [PendingOp]) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            if ops.is_empty() {
                return Ok(());
            }
            let body = render_rows(ops)?;
            self.exec_insert(body).await
        })
    }

    fn fetch(&self, subject: &str, id: u64) -> BoxFuture<'_, Result<Option<Message>, StorageError>> {
        let sql = fetch_sql(&self.table, subject, id);
        Box::pin(async move {
            let body = self.exec(&sql).await?;
            Ok(parse_rows(&body)?.into_iter().next())
        })
    }

    fn by_subject(&self, subject: &str) -> BoxFuture<'_, Result<Vec<Message>, StorageError>> {
        let sql = by_subject_sql(&self.table, subject);
        Box::pin(async move {
            let body = self.exec(&sql).await?;
            parse_rows(&body)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        // HTTP is stateless; pooled connections go with the client.
        Box::pin(async { Ok(()) })
    }
}

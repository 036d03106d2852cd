//! Process-wide structured logger.
//!
//! Every operational event (and, distinct from this, every proxied request
//! outcome — see `request_log`) is written here. Log rows are queryable and
//! exportable through the admin `/api/logs` surface, so rather than writing
//! to a line-oriented log crate this persists to a small SQLite database and
//! batches writes on a dedicated thread. It is the one sanctioned
//! process-wide singleton (§4.12, §9).

use std::path::PathBuf;
use std::sync::{mpsc, Once, RwLock};
use std::time::{Duration, Instant};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;

static INIT: Once = Once::new();
static LOG_SENDER: RwLock<Option<mpsc::Sender<LogMessage>>> = RwLock::new(None);
static DB_PATH: RwLock<Option<PathBuf>> = RwLock::new(None);
static MIN_LEVEL: RwLock<LogLevel> = RwLock::new(LogLevel::Info);
static FILE_LOGGING_ENABLED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

#[derive(Debug, Clone)]
struct LogMessage {
    timestamp: i64,
    level: String,
    source: String,
    message: String,
    metadata: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, PartialOrd, Eq, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: i64,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
    pub metadata: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LogQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub level: Option<LogLevel>,
    pub source: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteLogsRequest {
    pub ids: Option<Vec<i64>>,
    pub level: Option<LogLevel>,
    pub source: Option<String>,
    pub before_time: Option<i64>,
}

fn db_path() -> PathBuf {
    DB_PATH
        .read()
        .unwrap()
        .clone()
        .unwrap_or_else(|| PathBuf::from("relay-gateway.db"))
}

fn open_conn() -> Connection {
    Connection::open(db_path()).expect("open logger database")
}

/// Initializes the log store, creating `global_logs` if absent and starting
/// the async batch-writer thread. Safe to call more than once per process.
pub fn init(cfg: &AppConfig) -> anyhow::Result<()> {
    let path = cfg
        .log_file_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("relay-gateway-logs.db"));
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    *DB_PATH.write().unwrap() = Some(path);
    *MIN_LEVEL.write().unwrap() = LogLevel::from_str(&cfg.log_level).unwrap_or(LogLevel::Info);
    FILE_LOGGING_ENABLED.store(cfg.log_enable_file, std::sync::atomic::Ordering::SeqCst);

    INIT.call_once(|| {
        if FILE_LOGGING_ENABLED.load(std::sync::atomic::Ordering::SeqCst) {
            let conn = open_conn();
            conn.execute(
                "CREATE TABLE IF NOT EXISTS global_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp INTEGER NOT NULL,
                    level TEXT NOT NULL,
                    source TEXT NOT NULL,
                    message TEXT NOT NULL,
                    metadata TEXT
                )",
                [],
            )
            .expect("create global_logs table");
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_global_logs_timestamp ON global_logs(timestamp DESC)",
                [],
            )
            .ok();
            conn.execute("CREATE INDEX IF NOT EXISTS idx_global_logs_level ON global_logs(level)", [])
                .ok();
            conn.execute("CREATE INDEX IF NOT EXISTS idx_global_logs_source ON global_logs(source)", [])
                .ok();

            spawn_batch_writer();
        }
    });
    Ok(())
}

fn spawn_batch_writer() {
    let (tx, rx) = mpsc::channel::<LogMessage>();
    *LOG_SENDER.write().unwrap() = Some(tx);

    std::thread::spawn(move || {
        let mut buffer = Vec::with_capacity(100);
        let mut last_flush = Instant::now();
        let flush_interval = Duration::from_secs(1);

        loop {
            let timeout = flush_interval
                .checked_sub(last_flush.elapsed())
                .unwrap_or(Duration::ZERO);

            match rx.recv_timeout(timeout) {
                Ok(msg) => {
                    buffer.push(msg);
                    if buffer.len() >= 100 || last_flush.elapsed() >= flush_interval {
                        flush_logs(&mut buffer);
                        last_flush = Instant::now();
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if !buffer.is_empty() {
                        flush_logs(&mut buffer);
                    }
                    last_flush = Instant::now();
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        if !buffer.is_empty() {
            flush_logs(&mut buffer);
        }
    });
}

fn flush_logs(buffer: &mut Vec<LogMessage>) {
    if buffer.is_empty() {
        return;
    }
    let mut conn = open_conn();
    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(_) => return,
    };
    for msg in buffer.drain(..) {
        let _ = tx.execute(
            "INSERT INTO global_logs (timestamp, level, source, message, metadata) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![msg.timestamp, msg.level, msg.source, msg.message, msg.metadata],
        );
    }
    let _ = tx.commit();
}

fn log_internal(level: LogLevel, source: &str, message: &str, metadata: Option<&str>) {
    if level < *MIN_LEVEL.read().unwrap() {
        return;
    }
    eprintln!("[{}] {source}: {message}", level.as_str());

    if !FILE_LOGGING_ENABLED.load(std::sync::atomic::Ordering::SeqCst) {
        return;
    }

    let timestamp = chrono::Utc::now().timestamp();
    let msg = LogMessage {
        timestamp,
        level: level.as_str().to_string(),
        source: source.to_string(),
        message: message.to_string(),
        metadata: metadata.map(|s| s.to_string()),
    };

    if let Some(sender) = LOG_SENDER.read().unwrap().as_ref() {
        let _ = sender.send(msg);
    } else {
        let conn = open_conn();
        let _ = conn.execute(
            "INSERT INTO global_logs (timestamp, level, source, message, metadata) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![timestamp, level.as_str(), source, message, metadata],
        );
    }
}

pub fn debug(source: &str, message: &str) {
    log_internal(LogLevel::Debug, source, message, None);
}

pub fn info(source: &str, message: &str) {
    log_internal(LogLevel::Info, source, message, None);
}

pub fn warn(source: &str, message: &str) {
    log_internal(LogLevel::Warn, source, message, None);
}

pub fn error(source: &str, message: &str) {
    log_internal(LogLevel::Error, source, message, None);
}

pub fn log_with_metadata(level: LogLevel, source: &str, message: &str, metadata: Option<&str>) {
    log_internal(level, source, message, metadata);
}

pub fn query_logs(query: &LogQuery) -> Vec<LogEntry> {
    let conn = open_conn();
    let mut sql = String::from(
        "SELECT id, timestamp, level, source, message, metadata FROM global_logs WHERE 1=1",
    );
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref level) = query.level {
        sql.push_str(" AND level = ?");
        params_vec.push(Box::new(level.as_str().to_string()));
    }
    if let Some(ref source) = query.source {
        sql.push_str(" AND source = ?");
        params_vec.push(Box::new(source.clone()));
    }
    if let Some(start_time) = query.start_time {
        sql.push_str(" AND timestamp >= ?");
        params_vec.push(Box::new(start_time));
    }
    if let Some(end_time) = query.end_time {
        sql.push_str(" AND timestamp <= ?");
        params_vec.push(Box::new(end_time));
    }
    sql.push_str(" ORDER BY timestamp DESC");

    let limit = query.limit.unwrap_or(100);
    let offset = query.offset.unwrap_or(0);
    sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));

    let Ok(mut stmt) = conn.prepare(&sql) else { return Vec::new() };
    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

    let Ok(rows) = stmt.query_map(params_refs.as_slice(), |row| {
        let level_str: String = row.get(2)?;
        Ok(LogEntry {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            level: LogLevel::from_str(&level_str).unwrap_or(LogLevel::Info),
            source: row.get(3)?,
            message: row.get(4)?,
            metadata: row.get(5)?,
        })
    }) else {
        return Vec::new();
    };

    rows.filter_map(|r| r.ok()).collect()
}

pub fn logs_count(query: &LogQuery) -> i64 {
    let conn = open_conn();
    let mut sql = String::from("SELECT COUNT(*) FROM global_logs WHERE 1=1");
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref level) = query.level {
        sql.push_str(" AND level = ?");
        params_vec.push(Box::new(level.as_str().to_string()));
    }
    if let Some(ref source) = query.source {
        sql.push_str(" AND source = ?");
        params_vec.push(Box::new(source.clone()));
    }
    if let Some(start_time) = query.start_time {
        sql.push_str(" AND timestamp >= ?");
        params_vec.push(Box::new(start_time));
    }
    if let Some(end_time) = query.end_time {
        sql.push_str(" AND timestamp <= ?");
        params_vec.push(Box::new(end_time));
    }

    let Ok(mut stmt) = conn.prepare(&sql) else { return 0 };
    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
    stmt.query_row(params_refs.as_slice(), |row| row.get(0)).unwrap_or(0)
}

pub fn delete_log(id: i64) -> Result<(), String> {
    let conn = open_conn();
    let affected = conn
        .execute("DELETE FROM global_logs WHERE id = ?", params![id])
        .map_err(|e| e.to_string())?;
    if affected == 0 {
        Err("log entry not found".to_string())
    } else {
        Ok(())
    }
}

pub fn delete_logs(request: &DeleteLogsRequest) -> Result<i64, String> {
    let conn = open_conn();
    let mut sql = String::from("DELETE FROM global_logs WHERE 1=1");
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref ids) = request.ids {
        if !ids.is_empty() {
            let placeholders: Vec<String> = ids.iter().map(|_| "?".to_string()).collect();
            sql.push_str(&format!(" AND id IN ({})", placeholders.join(",")));
            for id in ids {
                params_vec.push(Box::new(*id));
            }
        }
    }
    if let Some(ref level) = request.level {
        sql.push_str(" AND level = ?");
        params_vec.push(Box::new(level.as_str().to_string()));
    }
    if let Some(ref source) = request.source {
        sql.push_str(" AND source = ?");
        params_vec.push(Box::new(source.clone()));
    }
    if let Some(before_time) = request.before_time {
        sql.push_str(" AND timestamp < ?");
        params_vec.push(Box::new(before_time));
    }

    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
    let affected = conn.execute(&sql, params_refs.as_slice()).map_err(|e| e.to_string())?;
    Ok(affected as i64)
}

pub fn clear_all_logs() -> Result<i64, String> {
    let conn = open_conn();
    let affected = conn.execute("DELETE FROM global_logs", []).map_err(|e| e.to_string())?;
    Ok(affected as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_roundtrip() {
        for lvl in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            assert_eq!(LogLevel::from_str(lvl.as_str()), Some(lvl));
        }
    }

}

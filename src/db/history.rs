use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::pipeline::state::RunState;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode history payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to prepare history directory '{path}': {message}")]
    Directory { path: String, message: String },
}

/// Durable sink for completed runs. Persisting the same run id again replaces
/// the earlier record.
pub trait HistorySink: Send + Sync + 'static {
    fn persist_run(&self, state: &RunState) -> Result<(), HistoryError>;
}

pub type SharedHistorySink = Arc<dyn HistorySink>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub product_id: String,
    pub category: String,
    pub route: Option<String>,
    pub best_path: Option<String>,
    pub source_fingerprint: Option<String>,
    pub generated: bool,
    pub final_score: Option<f64>,
    pub warning: Option<String>,
    pub retries_used: i64,
    pub feedback: Value,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRecord {
    pub position: i64,
    pub fingerprint: String,
    pub source: String,
    pub approval: Value,
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateRecord {
    pub path: String,
    pub mode: String,
    pub iter: i64,
    pub plan: Value,
    pub scores: Value,
    pub fallback: bool,
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageRecord {
    pub seq: i64,
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct SqliteHistoryStore {
    db_path: PathBuf,
}

impl SqliteHistoryStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn initialize(&self) -> Result<(), HistoryError> {
        self.with_connection(|_| Ok(()))
    }

    pub fn fetch_run(&self, run_id: &str) -> Result<Option<RunRecord>, HistoryError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "
                SELECT run_id, product_id, category, route, best_path, source_fingerprint,
                       generated, final_score, warning, retries_used, feedback_json,
                       created_at, updated_at
                FROM runs
                WHERE run_id = ?1
            ",
            )?;
            let row = stmt
                .query_row([run_id], |row| {
                    Ok((
                        RunRecord {
                            run_id: row.get(0)?,
                            product_id: row.get(1)?,
                            category: row.get(2)?,
                            route: row.get(3)?,
                            best_path: row.get(4)?,
                            source_fingerprint: row.get(5)?,
                            generated: row.get::<_, i64>(6)? != 0,
                            final_score: row.get(7)?,
                            warning: row.get(8)?,
                            retries_used: row.get(9)?,
                            feedback: Value::Null,
                            created_at: row.get(11)?,
                            updated_at: row.get(12)?,
                        },
                        row.get::<_, String>(10)?,
                    ))
                })
                .optional()?;
            Ok(row.map(|(mut record, feedback_json)| {
                record.feedback = parse_json_or_null(feedback_json.as_str());
                record
            }))
        })
    }

    pub fn count_runs(&self, run_id: Option<&str>) -> Result<i64, HistoryError> {
        self.with_connection(|conn| {
            let count = match run_id {
                Some(run_id) => conn.query_row(
                    "SELECT COUNT(*) FROM runs WHERE run_id = ?1",
                    [run_id],
                    |row| row.get(0),
                )?,
                None => conn.query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?,
            };
            Ok(count)
        })
    }

    pub fn list_images(&self, run_id: &str) -> Result<Vec<ImageRecord>, HistoryError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "
                SELECT position, image_hash, source, approval_json, accepted
                FROM images
                WHERE run_id = ?1
                ORDER BY position ASC
            ",
            )?;
            let rows = stmt.query_map([run_id], |row| {
                Ok(ImageRecord {
                    position: row.get(0)?,
                    fingerprint: row.get(1)?,
                    source: row.get(2)?,
                    approval: parse_json_or_null(row.get::<_, String>(3)?.as_str()),
                    accepted: row.get::<_, i64>(4)? != 0,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn list_candidates(&self, run_id: &str) -> Result<Vec<CandidateRecord>, HistoryError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "
                SELECT path, mode, iter, plan_json, scores_json, fallback, accepted
                FROM candidates
                WHERE run_id = ?1
                ORDER BY id ASC
            ",
            )?;
            let rows = stmt.query_map([run_id], |row| {
                Ok(CandidateRecord {
                    path: row.get(0)?,
                    mode: row.get(1)?,
                    iter: row.get(2)?,
                    plan: parse_json_or_null(row.get::<_, String>(3)?.as_str()),
                    scores: parse_json_or_null(row.get::<_, String>(4)?.as_str()),
                    fallback: row.get::<_, i64>(5)? != 0,
                    accepted: row.get::<_, i64>(6)? != 0,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn list_messages(&self, run_id: &str) -> Result<Vec<MessageRecord>, HistoryError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "
                SELECT seq, role, content
                FROM messages
                WHERE run_id = ?1
                ORDER BY seq ASC
            ",
            )?;
            let rows = stmt.query_map([run_id], |row| {
                Ok(MessageRecord {
                    seq: row.get(0)?,
                    role: row.get(1)?,
                    content: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    fn with_connection<T, F>(&self, func: F) -> Result<T, HistoryError>
    where
        F: FnOnce(&Connection) -> Result<T, HistoryError>,
    {
        self.ensure_parent_dir()?;
        let conn = Connection::open(self.db_path.as_path())?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        ensure_schema(&conn)?;
        func(&conn)
    }

    fn with_connection_mut<T, F>(&self, func: F) -> Result<T, HistoryError>
    where
        F: FnOnce(&mut Connection) -> Result<T, HistoryError>,
    {
        self.ensure_parent_dir()?;
        let mut conn = Connection::open(self.db_path.as_path())?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        ensure_schema(&conn)?;
        func(&mut conn)
    }

    fn ensure_parent_dir(&self) -> Result<(), HistoryError> {
        let Some(parent) = self.db_path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(());
        };
        std::fs::create_dir_all(parent).map_err(|error| HistoryError::Directory {
            path: parent.display().to_string(),
            message: error.to_string(),
        })
    }
}

impl HistorySink for SqliteHistoryStore {
    fn persist_run(&self, state: &RunState) -> Result<(), HistoryError> {
        let metadata = state.metadata();
        let decision = state.decision();
        let best = state.best();
        let route = decision.map(|decision| decision.route.as_str());
        let feedback_json = match decision {
            Some(decision) => serde_json::to_string(&decision.feedback)?,
            None => String::from("{}"),
        };
        let best_path = best
            .and_then(|best| best.path.as_ref())
            .map(|path| path.display().to_string());
        let source_fingerprint = best
            .and_then(|best| best.source_fingerprint.as_ref())
            .map(|fp| fp.to_string());
        let warning = best
            .and_then(|best| best.warning)
            .map(serde_json::to_value)
            .transpose()?
            .and_then(|value| value.as_str().map(str::to_string));
        let now = now_iso();

        self.with_connection_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "
                INSERT INTO runs (
                  run_id, product_id, category, route, best_path, source_fingerprint,
                  generated, final_score, warning, retries_used, feedback_json,
                  created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
                ON CONFLICT(run_id) DO UPDATE SET
                  product_id = excluded.product_id,
                  category = excluded.category,
                  route = excluded.route,
                  best_path = excluded.best_path,
                  source_fingerprint = excluded.source_fingerprint,
                  generated = excluded.generated,
                  final_score = excluded.final_score,
                  warning = excluded.warning,
                  retries_used = excluded.retries_used,
                  feedback_json = excluded.feedback_json,
                  updated_at = excluded.updated_at
            ",
                params![
                    metadata.run_id,
                    metadata.product_id,
                    metadata.category,
                    route,
                    best_path,
                    source_fingerprint,
                    i64::from(best.is_some_and(|best| best.generated)),
                    best.map(|best| best.final_score),
                    warning,
                    i64::from(state.retry_count()),
                    feedback_json,
                    now,
                ],
            )?;

            for table in ["images", "candidates", "messages"] {
                tx.execute(
                    format!("DELETE FROM {table} WHERE run_id = ?1").as_str(),
                    [metadata.run_id.as_str()],
                )?;
            }

            for (position, input) in state.inputs().iter().enumerate() {
                let fingerprint = input.fingerprint();
                let approval_json = match state.approval(fingerprint) {
                    Some(record) => serde_json::to_string(record)?,
                    None => String::from("{}"),
                };
                let accepted = best.is_some_and(|best| {
                    !best.generated && best.source_fingerprint.as_ref() == Some(fingerprint)
                });
                tx.execute(
                    "
                    INSERT INTO images (run_id, position, image_hash, source, approval_json, accepted, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
                    params![
                        metadata.run_id,
                        position as i64,
                        fingerprint.as_str(),
                        input.provenance().as_tag(),
                        approval_json,
                        i64::from(accepted),
                        now,
                    ],
                )?;
            }

            for candidate in state.candidates() {
                let scores_json = match candidate.verdict.as_ref() {
                    Some(verdict) => serde_json::to_string(verdict)?,
                    None => String::from("{}"),
                };
                tx.execute(
                    "
                    INSERT INTO candidates (run_id, path, mode, iter, plan_json, scores_json, fallback, accepted, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ",
                    params![
                        metadata.run_id,
                        candidate.path.display().to_string(),
                        candidate.strategy.as_str(),
                        i64::from(candidate.retry_index),
                        serde_json::to_string(&candidate.plan.body)?,
                        scores_json,
                        i64::from(candidate.fallback),
                        i64::from(candidate.accepted),
                        now,
                    ],
                )?;
            }

            for (seq, message) in state.messages().iter().enumerate() {
                tx.execute(
                    "
                    INSERT INTO messages (run_id, seq, role, content, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                ",
                    params![
                        metadata.run_id,
                        seq as i64,
                        message.role.as_str(),
                        message.content,
                        now,
                    ],
                )?;
            }

            tx.commit()?;
            Ok(())
        })?;

        info!(
            run_id = metadata.run_id.as_str(),
            route = route.unwrap_or("none"),
            candidates = state.candidates().len(),
            "run persisted to history"
        );
        Ok(())
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), HistoryError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS runs (
          run_id TEXT PRIMARY KEY,
          product_id TEXT NOT NULL,
          category TEXT NOT NULL,
          route TEXT,
          best_path TEXT,
          source_fingerprint TEXT,
          generated INTEGER NOT NULL DEFAULT 0,
          final_score REAL,
          warning TEXT,
          retries_used INTEGER NOT NULL DEFAULT 0,
          feedback_json TEXT NOT NULL DEFAULT '{}',
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS images (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
          position INTEGER NOT NULL,
          image_hash TEXT NOT NULL,
          source TEXT NOT NULL,
          approval_json TEXT NOT NULL DEFAULT '{}',
          accepted INTEGER NOT NULL DEFAULT 0,
          created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS candidates (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
          path TEXT NOT NULL,
          mode TEXT NOT NULL,
          iter INTEGER NOT NULL,
          plan_json TEXT NOT NULL DEFAULT '{}',
          scores_json TEXT NOT NULL DEFAULT '{}',
          fallback INTEGER NOT NULL DEFAULT 0,
          accepted INTEGER NOT NULL DEFAULT 0,
          created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
          seq INTEGER NOT NULL,
          role TEXT NOT NULL,
          content TEXT NOT NULL,
          created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_images_run ON images(run_id);
        CREATE INDEX IF NOT EXISTS idx_candidates_run ON candidates(run_id);
        CREATE INDEX IF NOT EXISTS idx_messages_run ON messages(run_id, seq);
    ",
    )?;
    Ok(())
}

fn parse_json_or_null(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Null)
}

fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::state::{
        BestResult, Decision, DecisionFeedback, DecisionSubject, ImageInput, ImageProvenance,
        MessageRole, Route, RunMetadata, Verdict, VerdictRecord,
    };
    use std::collections::HashMap;

    fn temp_db() -> (PathBuf, SqliteHistoryStore) {
        let root = std::env::temp_dir().join(format!("sparkle_history_{}", uuid::Uuid::new_v4()));
        let store = SqliteHistoryStore::new(root.join("history.sqlite"));
        (root, store)
    }

    fn approved_state(run_id: &str) -> RunState {
        let input = ImageInput::new(
            b"original".to_vec(),
            ImageProvenance::Remote {
                url: String::from("https://cdn.example.com/a.jpg"),
            },
        );
        let fingerprint = input.fingerprint().clone();
        let mut state = RunState::new(
            RunMetadata {
                run_id: run_id.to_string(),
                product_id: String::from("sku-42"),
                category: String::from("kurti"),
            },
            vec![input],
        );
        let mut approvals = HashMap::new();
        approvals.insert(
            fingerprint.clone(),
            VerdictRecord {
                relevance: 0.85,
                reality: 0.75,
                integrity: 0.97,
                quality: 0.5,
                verdict: Verdict::Approve,
                reasons: vec![String::from("on-model")],
            },
        );
        state.record_approvals(approvals);
        state.set_decision(Decision {
            route: Route::Approved,
            chosen: Some(DecisionSubject::Original(fingerprint.clone())),
            feedback: DecisionFeedback::accepted(),
        });
        state.push_message(MessageRole::System, "Ingested 1 images");
        state
            .finalize(
                BestResult {
                    generated: false,
                    path: None,
                    source_fingerprint: Some(fingerprint),
                    final_score: 0.795,
                    warning: None,
                },
                Route::A,
            )
            .expect("finalize should succeed");
        state
    }

    #[test]
    fn persists_run_images_and_messages() {
        let (root, store) = temp_db();
        let state = approved_state("run_persist");

        store.persist_run(&state).expect("persist should succeed");

        let run = store
            .fetch_run("run_persist")
            .expect("fetch should succeed")
            .expect("run should exist");
        assert_eq!(run.product_id, "sku-42");
        assert_eq!(run.route.as_deref(), Some("A"));
        assert!(!run.generated);
        assert_eq!(run.final_score, Some(0.795));
        assert_eq!(run.feedback["next_action"], "OUTPUT");

        let images = store.list_images("run_persist").expect("images should list");
        assert_eq!(images.len(), 1);
        assert!(images[0].accepted);
        assert_eq!(images[0].source, "https://cdn.example.com/a.jpg");
        assert_eq!(images[0].approval["relevance"], 0.85);

        let messages = store.list_messages("run_persist").expect("messages should list");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "system");
        assert!(store
            .list_candidates("run_persist")
            .expect("candidates should list")
            .is_empty());

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn persisting_same_run_twice_keeps_one_record() {
        let (root, store) = temp_db();
        let mut state = approved_state("run_twice");

        store.persist_run(&state).expect("first persist should succeed");
        state.push_message(MessageRole::System, "persisted to history");
        store.persist_run(&state).expect("second persist should succeed");

        assert_eq!(store.count_runs(Some("run_twice")).expect("count"), 1);
        assert_eq!(store.count_runs(None).expect("count"), 1);
        assert_eq!(store.list_images("run_twice").expect("images").len(), 1);
        assert_eq!(store.list_messages("run_twice").expect("messages").len(), 2);

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn fetch_missing_run_returns_none() {
        let (root, store) = temp_db();
        store.initialize().expect("schema should initialize");
        assert_eq!(store.fetch_run("nope").expect("fetch should succeed"), None);
        let _ = std::fs::remove_dir_all(root);
    }
}

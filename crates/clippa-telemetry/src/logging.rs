use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS warnings (
        seq       INTEGER PRIMARY KEY AUTOINCREMENT,
        logged_at TEXT NOT NULL,
        level     TEXT NOT NULL,
        message   TEXT NOT NULL,
        party_id  TEXT,
        member_id TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_warnings_party ON warnings(party_id);";

/// A persisted warning or error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub logged_at: String,
    pub level: String,
    pub message: String,
    pub party_id: Option<String>,
    pub member_id: Option<String>,
}

/// Filter for [`SqliteLogSink::query`]. Results are newest first.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub party_id: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite table of WARN and ERROR events.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let _ = std::fs::create_dir_all(dir);
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn append(&self, record: &LogRecord) -> Result<(), rusqlite::Error> {
        self.conn.lock().execute(
            "INSERT INTO warnings (logged_at, level, message, party_id, member_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.logged_at,
                record.level,
                record.message,
                record.party_id,
                record.member_id
            ],
        )?;
        Ok(())
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT logged_at, level, message, party_id, member_id FROM warnings
             WHERE ?1 IS NULL OR party_id = ?1
             ORDER BY seq DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![q.party_id, q.limit.unwrap_or(100)], |row| {
            Ok(LogRecord {
                logged_at: row.get(0)?,
                level: row.get(1)?,
                message: row.get(2)?,
                party_id: row.get(3)?,
                member_id: row.get(4)?,
            })
        })?;
        rows.collect()
    }
}

/// Party and member ids attached to a span or event.
#[derive(Clone, Default)]
struct Scope {
    party_id: Option<String>,
    member_id: Option<String>,
}

impl Scope {
    fn is_empty(&self) -> bool {
        self.party_id.is_none() && self.member_id.is_none()
    }

    /// Fill gaps from an enclosing scope. Inner values win.
    fn inherit(&mut self, outer: &Scope) {
        if self.party_id.is_none() {
            self.party_id.clone_from(&outer.party_id);
        }
        if self.member_id.is_none() {
            self.member_id.clone_from(&outer.member_id);
        }
    }
}

#[derive(Default)]
struct Collect {
    message: String,
    scope: Scope,
}

impl Visit for Collect {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "party_id" => self.scope.party_id = Some(value.to_string()),
            "member_id" => self.scope.member_id = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        // `%id` arrives here already formatted with Display
        self.record_str(field, format!("{value:?}").trim_matches('"'));
    }
}

/// Persists WARN+ events, tagged with the innermost `party_id` /
/// `member_id` on the event or its spans.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = Collect::default();
        attrs.record(&mut fields);
        if fields.scope.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(fields.scope);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut fields = Collect::default();
        event.record(&mut fields);
        for span in ctx.event_scope(event).into_iter().flatten() {
            if let Some(outer) = span.extensions().get::<Scope>() {
                fields.scope.inherit(outer);
            }
        }

        let record = LogRecord {
            logged_at: Utc::now().to_rfc3339(),
            level: level.as_str().to_string(),
            message: fields.message,
            party_id: fields.scope.party_id,
            member_id: fields.scope.member_id,
        };
        // Logging must never fail the caller.
        let _ = self.sink.append(&record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture(f: impl FnOnce()) -> Arc<SqliteLogSink> {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, f);
        sink
    }

    #[test]
    fn sink_on_disk() {
        let dir = std::env::temp_dir().join(format!("clippa-test-logs-{}", uuid::Uuid::now_v7()));
        let sink = SqliteLogSink::new(&dir.join("logs.db")).unwrap();
        sink.append(&LogRecord {
            logged_at: Utc::now().to_rfc3339(),
            level: "WARN".into(),
            message: "slow member".into(),
            party_id: Some("party_1".into()),
            member_id: None,
        })
        .unwrap();
        assert_eq!(sink.query(&LogQuery::default()).unwrap().len(), 1);
        drop(sink);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn only_warn_and_error_are_kept() {
        let sink = capture(|| {
            let span = tracing::info_span!("session", party_id = "party_x", member_id = "member_y");
            let _entered = span.enter();
            tracing::debug!("frame relayed");
            tracing::info!("joined");
            tracing::warn!(attempts = 3, "member evicted");
        });

        let records = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, "WARN");
        assert_eq!(records[0].message, "member evicted");
        assert_eq!(records[0].party_id.as_deref(), Some("party_x"));
        assert_eq!(records[0].member_id.as_deref(), Some("member_y"));
    }

    #[test]
    fn event_fields_override_span_fields() {
        let sink = capture(|| {
            let outer = tracing::info_span!("hub", party_id = "party_outer", member_id = "m1");
            let _outer = outer.enter();
            let inner = tracing::info_span!("write");
            let _inner = inner.enter();
            tracing::error!(party_id = "party_inner", "store failed");
        });

        let records = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(records[0].party_id.as_deref(), Some("party_inner"));
        assert_eq!(records[0].member_id.as_deref(), Some("m1"));
    }

    #[test]
    fn query_filters_by_party_newest_first() {
        let sink = capture(|| {
            for i in 0..5 {
                tracing::warn!(party_id = "party_a", "a{i}");
            }
            tracing::error!(party_id = "party_b", "b");
        });

        let party_a = sink
            .query(&LogQuery {
                party_id: Some("party_a".into()),
                limit: Some(2),
            })
            .unwrap();
        let messages: Vec<_> = party_a.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, ["a4", "a3"]);
        assert_eq!(sink.query(&LogQuery::default()).unwrap().len(), 6);
    }
}

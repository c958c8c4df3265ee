//! SQLite backend with strictly typed tables.
//!
//! Each node kind has its own table and each edge kind its own relationship
//! table, so an edge row can only be written by a statement that names both
//! concrete endpoint tables. Node and edge ids come from shared sequences
//! and are unique across tables.

use r2d2::{ManageConnection, Pool, PooledConnection};
use rusqlite::types::{Type, Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use super::query::{DistinctQuery, Field, Predicate};
use super::types::*;
use super::{BackendError, Dialect, GraphBackend, Record};
use crate::ir::{EdgeKind, IdentityKey, NodeKind};

impl From<rusqlite::Error> for BackendError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::CannotOpen
                        | ErrorCode::SystemIoFailure
                ) =>
            {
                BackendError::Transport(e.to_string())
            }
            _ => BackendError::Query(e.to_string()),
        }
    }
}

impl From<r2d2::Error> for BackendError {
    fn from(e: r2d2::Error) -> Self {
        BackendError::Transport(e.to_string())
    }
}

fn node_table(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::File => "node_file",
        NodeKind::Function => "node_function",
        NodeKind::Class => "node_class",
        NodeKind::Variable => "node_variable",
        NodeKind::Module => "node_module",
    }
}

fn rel_table(kind: EdgeKind) -> &'static str {
    match kind {
        EdgeKind::Calls => "rel_calls",
        EdgeKind::Contains => "rel_contains",
        EdgeKind::Inherits => "rel_inherits",
        EdgeKind::Imports => "rel_imports",
    }
}

fn schema_sql() -> String {
    let mut sql = String::from(
        "CREATE TABLE IF NOT EXISTS node_seq (id INTEGER PRIMARY KEY AUTOINCREMENT);
         CREATE TABLE IF NOT EXISTS edge_seq (id INTEGER PRIMARY KEY AUTOINCREMENT);\n",
    );
    let mut node_views = Vec::new();
    for kind in NodeKind::ALL {
        let t = node_table(kind);
        sql.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                id INTEGER PRIMARY KEY,
                qualified_name TEXT NOT NULL,
                file_path TEXT NOT NULL,
                name TEXT NOT NULL,
                start_line INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                decorators TEXT NOT NULL DEFAULT '[]',
                is_dependency INTEGER NOT NULL DEFAULT 0,
                scope TEXT NOT NULL,
                extra TEXT NOT NULL DEFAULT '{{}}',
                UNIQUE(qualified_name, file_path)
            );
            CREATE INDEX IF NOT EXISTS idx_{t}_file ON {t}(file_path);
            CREATE INDEX IF NOT EXISTS idx_{t}_scope ON {t}(scope);\n"
        ));
        node_views.push(format!("SELECT '{kind}' AS kind, * FROM {t}"));
    }
    let mut edge_views = Vec::new();
    for kind in EdgeKind::ALL {
        let r = rel_table(kind);
        sql.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {r} (
                id INTEGER PRIMARY KEY,
                from_kind TEXT NOT NULL,
                from_id INTEGER NOT NULL,
                to_kind TEXT NOT NULL,
                to_id INTEGER NOT NULL,
                line_number INTEGER,
                scope TEXT NOT NULL,
                extra TEXT NOT NULL DEFAULT '{{}}',
                UNIQUE(from_id, to_id)
            );
            CREATE INDEX IF NOT EXISTS idx_{r}_to ON {r}(to_id);
            CREATE INDEX IF NOT EXISTS idx_{r}_scope ON {r}(scope);\n"
        ));
        edge_views.push(format!("SELECT '{kind}' AS kind, * FROM {r}"));
    }
    sql.push_str(&format!(
        "CREATE VIEW IF NOT EXISTS all_nodes AS {};\n",
        node_views.join(" UNION ALL ")
    ));
    sql.push_str(&format!(
        "CREATE VIEW IF NOT EXISTS all_edges AS {};\n",
        edge_views.join(" UNION ALL ")
    ));
    sql
}

const NODE_COLUMNS: &str =
    "kind, id, qualified_name, file_path, name, start_line, end_line, decorators, is_dependency, scope, extra";

// ─── Connection Management ──────────────────────────────────

#[derive(Debug, Clone)]
enum Target {
    File(PathBuf),
    /// Named shared-cache in-memory database.
    SharedMemory(String),
}

#[derive(Debug)]
struct SqliteManager {
    target: Target,
    busy_timeout: Duration,
}

impl ManageConnection for SqliteManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        let conn = match &self.target {
            Target::File(path) => {
                let conn = Connection::open(path)?;
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
                conn
            }
            Target::SharedMemory(name) => Connection::open_with_flags(
                format!("file:{name}?mode=memory&cache=shared"),
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )?,
        };
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch("SELECT 1;")
    }

    fn has_broken(&self, _conn: &mut Connection) -> bool {
        false
    }
}

/// Pooled SQLite graph store.
pub struct SqliteBackend {
    pool: Pool<SqliteManager>,
    location: String,
    closed: AtomicBool,
}

impl SqliteBackend {
    /// Open (or create) a database file.
    pub fn open(path: &Path, pool_size: u32, busy_timeout: Duration) -> Result<Self, BackendError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| BackendError::Transport(format!("{}: {}", parent.display(), e)))?;
            }
        }
        let manager = SqliteManager {
            target: Target::File(path.to_path_buf()),
            busy_timeout,
        };
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_timeout(Duration::from_secs(10))
            .build(manager)?;
        Self::init(pool, path.display().to_string())
    }

    /// A private in-memory database shared by the pool's connections.
    ///
    /// Shared-cache memory databases lock per table rather than honour the
    /// busy timeout, so the pool is held to a single long-lived connection.
    pub fn open_in_memory(_pool_size: u32, busy_timeout: Duration) -> Result<Self, BackendError> {
        let name = format!("cgc-{}", uuid::Uuid::new_v4());
        let manager = SqliteManager {
            target: Target::SharedMemory(name.clone()),
            busy_timeout,
        };
        let pool = Pool::builder()
            .max_size(1)
            .min_idle(Some(1))
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;
        Self::init(pool, format!("memory:{name}"))
    }

    fn init(pool: Pool<SqliteManager>, location: String) -> Result<Self, BackendError> {
        let conn = pool.get()?;
        conn.execute_batch(&schema_sql())?;
        drop(conn);
        info!(location = %location, "sqlite backend ready");
        Ok(Self {
            pool,
            location,
            closed: AtomicBool::new(false),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    fn conn(&self) -> Result<PooledConnection<SqliteManager>, BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed);
        }
        Ok(self.pool.get()?)
    }

    /// Run `f` inside a write transaction taken up front.
    fn write<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

// ─── Row Mapping ────────────────────────────────────────────

fn conversion_err(
    col: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, Type::Text, e.into())
}

fn kind_at<K: std::str::FromStr<Err = String>>(row: &Row<'_>, col: usize) -> rusqlite::Result<K> {
    let raw: String = row.get(col)?;
    raw.parse().map_err(|e: String| conversion_err(col, e))
}

fn json_at<T: serde::de::DeserializeOwned>(row: &Row<'_>, col: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(col)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(col, e))
}

/// Maps a row selected with [`NODE_COLUMNS`].
fn node_from_row(row: &Row<'_>) -> rusqlite::Result<NodeRecord> {
    let kind: NodeKind = kind_at(row, 0)?;
    Ok(NodeRecord {
        id: NodeId(row.get(1)?),
        key: IdentityKey {
            kind,
            qualified_name: row.get(2)?,
            file_path: row.get(3)?,
        },
        props: NodeProps {
            name: row.get(4)?,
            start_line: row.get(5)?,
            end_line: row.get(6)?,
            decorators: json_at(row, 7)?,
            is_dependency: row.get(8)?,
            scope: row.get(9)?,
            extra: json_at(row, 10)?,
        },
    })
}

fn json_from_sql(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::from(b.to_vec()),
    }
}

fn sql_from_json(v: &Value) -> SqlValue {
    match v {
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Aliases are user-chosen and may collide with SQL keywords.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn lookup_id(
    conn: &Connection,
    key: &IdentityKey,
) -> Result<Option<i64>, BackendError> {
    let sql = format!(
        "SELECT id FROM {} WHERE qualified_name = ?1 AND file_path = ?2",
        node_table(key.kind)
    );
    Ok(conn
        .prepare_cached(&sql)?
        .query_row(params![key.qualified_name, key.file_path], |r| r.get(0))
        .optional()?)
}

fn next_id(conn: &Connection, seq: &str) -> Result<i64, BackendError> {
    conn.execute(&format!("INSERT INTO {seq} DEFAULT VALUES"), [])?;
    let id = conn.last_insert_rowid();
    conn.execute(&format!("DELETE FROM {seq}"), [])?;
    Ok(id)
}

impl GraphBackend for SqliteBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn upsert_node(&self, key: &IdentityKey, props: &NodeProps) -> Result<NodeId, BackendError> {
        let decorators = serde_json::to_string(&props.decorators)?;
        let extra = serde_json::to_string(&props.extra)?;
        let table = node_table(key.kind);
        self.write(|tx| {
            if let Some(id) = lookup_id(tx, key)? {
                tx.prepare_cached(&format!(
                    "UPDATE {table} SET name = ?2, start_line = ?3, end_line = ?4,
                     decorators = ?5, is_dependency = ?6, scope = ?7, extra = ?8
                     WHERE id = ?1"
                ))?
                .execute(params![
                    id,
                    props.name,
                    props.start_line,
                    props.end_line,
                    decorators,
                    props.is_dependency,
                    props.scope,
                    extra
                ])?;
                return Ok(NodeId(id));
            }
            let id = next_id(tx, "node_seq")?;
            tx.prepare_cached(&format!(
                "INSERT INTO {table} (id, qualified_name, file_path, name, start_line, end_line,
                                      decorators, is_dependency, scope, extra)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ))?
            .execute(params![
                id,
                key.qualified_name,
                key.file_path,
                props.name,
                props.start_line,
                props.end_line,
                decorators,
                props.is_dependency,
                props.scope,
                extra
            ])?;
            Ok(NodeId(id))
        })
    }

    fn merge_typed_edge(
        &self,
        from: &IdentityKey,
        to: &IdentityKey,
        kind: EdgeKind,
        props: &EdgeProps,
    ) -> Result<EdgeMerge, BackendError> {
        let (ft, tt, rel) = (node_table(from.kind), node_table(to.kind), rel_table(kind));
        let endpoint_args = params![
            from.qualified_name,
            from.file_path,
            to.qualified_name,
            to.file_path
        ];
        let extra = serde_json::to_string(&props.extra)?;
        self.write(|tx| {
            // Statements run in order, each naming the concrete endpoint
            // tables; the first that matches decides the outcome.
            let existing: Option<i64> = tx
                .prepare_cached(&format!(
                    "SELECT e.id FROM {rel} e
                     JOIN {ft} f ON f.id = e.from_id
                     JOIN {tt} t ON t.id = e.to_id
                     WHERE f.qualified_name = ?1 AND f.file_path = ?2
                       AND t.qualified_name = ?3 AND t.file_path = ?4"
                ))?
                .query_row(endpoint_args, |r| r.get(0))
                .optional()?;
            if existing.is_some() {
                return Ok(EdgeMerge {
                    created: false,
                    matched: true,
                });
            }

            let endpoints: Option<(i64, i64)> = tx
                .prepare_cached(&format!(
                    "SELECT f.id, t.id FROM {ft} f, {tt} t
                     WHERE f.qualified_name = ?1 AND f.file_path = ?2
                       AND t.qualified_name = ?3 AND t.file_path = ?4"
                ))?
                .query_row(endpoint_args, |r| Ok((r.get(0)?, r.get(1)?)))
                .optional()?;
            let Some((from_id, to_id)) = endpoints else {
                return Ok(EdgeMerge::MISSING_ENDPOINT);
            };

            let id = next_id(tx, "edge_seq")?;
            tx.prepare_cached(&format!(
                "INSERT INTO {rel} (id, from_kind, from_id, to_kind, to_id, line_number, scope, extra)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ))?
            .execute(params![
                id,
                from.kind.as_str(),
                from_id,
                to.kind.as_str(),
                to_id,
                props.line_number,
                props.scope,
                extra
            ])?;
            Ok(EdgeMerge {
                created: true,
                matched: true,
            })
        })
    }

    fn query_ordered_distinct(&self, query: &DistinctQuery) -> Result<Vec<Record>, BackendError> {
        let kinds = query.kinds();
        if kinds.is_empty() {
            return Ok(Vec::new());
        }
        let source = kinds
            .iter()
            .map(|k| {
                format!(
                    "SELECT '{k}' AS kind, qualified_name, name, file_path, start_line, end_line, scope, is_dependency FROM {}",
                    node_table(*k)
                )
            })
            .collect::<Vec<_>>()
            .join(" UNION ALL ");

        let columns = query
            .projections()
            .iter()
            .map(|p| format!("n.{} AS {}", p.field.property(), quote_ident(&p.alias)))
            .collect::<Vec<_>>()
            .join(", ");

        let mut conditions = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();
        for predicate in query.predicates() {
            match predicate {
                Predicate::KindIn(_) => {}
                Predicate::Eq(field, value) => {
                    conditions.push(format!("n.{} = ?", field.property()));
                    args.push(sql_from_json(value));
                }
                Predicate::PathPrefix(prefix) => {
                    conditions.push("substr(n.file_path, 1, ?) = ?".to_string());
                    args.push(SqlValue::Integer(prefix.chars().count() as i64));
                    args.push(SqlValue::Text(prefix.clone()));
                }
                Predicate::NameContains(part) => {
                    conditions.push("instr(n.name, ?) > 0".to_string());
                    args.push(SqlValue::Text(part.clone()));
                }
            }
        }
        let filter = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let direction = if query.descending() { "DESC" } else { "ASC" };
        let mut order = vec![format!("{} {}", quote_ident(query.order_by()), direction)];
        order.extend(
            query
                .aliases()
                .iter()
                .filter(|a| a.as_str() != query.order_by())
                .map(|a| format!("{} ASC", quote_ident(a))),
        );
        let limit = match query.limit() {
            Some(n) => format!("LIMIT {n}"),
            None => String::new(),
        };

        let sql = format!(
            "SELECT DISTINCT {columns} FROM ({source}) AS n {filter} ORDER BY {} {limit}",
            order.join(", ")
        );
        debug!(sql = %sql, "ordered distinct query");

        let fields: Vec<Field> = query.projections().iter().map(|p| p.field).collect();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            fields
                .iter()
                .enumerate()
                .map(|(i, field)| {
                    let value = json_from_sql(row.get_ref(i)?);
                    Ok(match (field, value) {
                        (Field::IsDependency, Value::Number(n)) => Value::Bool(n.as_i64() != Some(0)),
                        (_, v) => v,
                    })
                })
                .collect::<rusqlite::Result<Vec<Value>>>()
        })?;
        let aliases = query.aliases();
        let mut records = Vec::new();
        for row in rows {
            records.push(Record::new(aliases.clone(), row?));
        }
        Ok(records)
    }

    fn traverse_paths(
        &self,
        anchor: &IdentityKey,
        kind: EdgeKind,
        min_depth: usize,
        max_depth: usize,
    ) -> Result<Vec<PathEndpoint>, BackendError> {
        let conn = self.conn()?;
        let Some(start) = lookup_id(&conn, anchor)? else {
            return Ok(Vec::new());
        };
        // The walk never constrains the terminal node; endpoints are read
        // off the finished paths and resolved against every node table.
        let rel = rel_table(kind);
        let sql = format!(
            "WITH RECURSIVE walk(node_id, depth, trail) AS (
                SELECT ?1, 0, ',' || ?1 || ','
                UNION ALL
                SELECT e.to_id, w.depth + 1, w.trail || e.to_id || ','
                FROM walk w JOIN {rel} e ON e.from_id = w.node_id
                WHERE w.depth < ?3 AND instr(w.trail, ',' || e.to_id || ',') = 0
            )
            SELECT n.id, n.kind, n.qualified_name, n.file_path, MIN(w.depth)
            FROM walk w JOIN all_nodes n ON n.id = w.node_id
            WHERE w.depth >= ?2
            GROUP BY n.id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![start, min_depth as i64, max_depth as i64], |row| {
            let depth: i64 = row.get(4)?;
            Ok(PathEndpoint {
                id: NodeId(row.get(0)?),
                key: IdentityKey {
                    kind: kind_at(row, 1)?,
                    qualified_name: row.get(2)?,
                    file_path: row.get(3)?,
                },
                depth: depth as usize,
            })
        })?;
        let mut endpoints = Vec::new();
        for row in rows {
            endpoints.push(row?);
        }
        endpoints.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.key.cmp(&b.key)));
        debug!(anchor = %anchor, endpoints = endpoints.len(), "sqlite traversal");
        Ok(endpoints)
    }

    fn run_read_query(&self, query: &str) -> Result<Vec<Record>, BackendError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(query)?;
        if !stmt.readonly() {
            return Err(BackendError::ReadOnlyViolation(query.trim().to_string()));
        }
        let keys: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = keys.len();
        let rows = stmt.query_map([], |row| {
            (0..width)
                .map(|i| row.get_ref(i).map(json_from_sql))
                .collect::<rusqlite::Result<Vec<Value>>>()
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(Record::new(keys.clone(), row?));
        }
        Ok(records)
    }

    fn node_id(&self, key: &IdentityKey) -> Result<Option<NodeId>, BackendError> {
        let conn = self.conn()?;
        Ok(lookup_id(&conn, key)?.map(NodeId))
    }

    fn get_node(&self, key: &IdentityKey) -> Result<Option<NodeRecord>, BackendError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT '{}' AS kind, id, qualified_name, file_path, name, start_line, end_line,
                    decorators, is_dependency, scope, extra
             FROM {} WHERE qualified_name = ?1 AND file_path = ?2",
            key.kind,
            node_table(key.kind)
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let node = stmt
            .query_row(params![key.qualified_name, key.file_path], node_from_row)
            .optional()?;
        Ok(node)
    }

    fn delete_file(&self, file_path: &str) -> Result<DeleteReport, BackendError> {
        self.write(|tx| {
            let mut report = DeleteReport::default();
            for kind in NodeKind::ALL {
                let t = node_table(kind);
                for edge_kind in EdgeKind::ALL {
                    let r = rel_table(edge_kind);
                    report.edges += tx.execute(
                        &format!(
                            "DELETE FROM {r}
                             WHERE from_id IN (SELECT id FROM {t} WHERE file_path = ?1)
                                OR to_id IN (SELECT id FROM {t} WHERE file_path = ?1)"
                        ),
                        params![file_path],
                    )?;
                }
                report.nodes +=
                    tx.execute(&format!("DELETE FROM {t} WHERE file_path = ?1"), params![file_path])?;
            }
            Ok(report)
        })
    }

    fn delete_scope(&self, scope: &str) -> Result<DeleteReport, BackendError> {
        // Edges from other scopes into this one are left for the dangling pass.
        self.write(|tx| {
            let mut report = DeleteReport::default();
            for kind in EdgeKind::ALL {
                report.edges += tx.execute(
                    &format!("DELETE FROM {} WHERE scope = ?1", rel_table(kind)),
                    params![scope],
                )?;
            }
            for kind in NodeKind::ALL {
                report.nodes += tx.execute(
                    &format!("DELETE FROM {} WHERE scope = ?1", node_table(kind)),
                    params![scope],
                )?;
            }
            Ok(report)
        })
    }

    fn prune_dangling_edges(&self) -> Result<usize, BackendError> {
        self.write(|tx| {
            let mut removed = 0;
            for kind in EdgeKind::ALL {
                removed += tx.execute(
                    &format!(
                        "DELETE FROM {} WHERE from_id NOT IN (SELECT id FROM all_nodes)
                                          OR to_id NOT IN (SELECT id FROM all_nodes)",
                        rel_table(kind)
                    ),
                    [],
                )?;
            }
            Ok(removed)
        })
    }

    fn clear(&self) -> Result<(), BackendError> {
        self.write(|tx| {
            for kind in EdgeKind::ALL {
                tx.execute(&format!("DELETE FROM {}", rel_table(kind)), [])?;
            }
            for kind in NodeKind::ALL {
                tx.execute(&format!("DELETE FROM {}", node_table(kind)), [])?;
            }
            Ok(())
        })
    }

    fn scan_nodes(
        &self,
        scope: Option<&str>,
        after: Option<NodeId>,
        limit: usize,
    ) -> Result<Vec<NodeRecord>, BackendError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {NODE_COLUMNS} FROM all_nodes
             WHERE id > ?1 AND (?2 IS NULL OR scope = ?2)
             ORDER BY id LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![after.map_or(0, |id| id.0), scope, limit as i64],
            node_from_row,
        )?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row?);
        }
        Ok(nodes)
    }

    fn scan_edges(
        &self,
        filter: &EdgeFilter,
        after: Option<EdgeId>,
        limit: usize,
    ) -> Result<Vec<EdgeRecord>, BackendError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT e.id, e.kind, f.kind, f.qualified_name, f.file_path,
                    t.kind, t.qualified_name, t.file_path, e.line_number, e.scope, e.extra
             FROM all_edges e
             JOIN all_nodes f ON f.id = e.from_id
             JOIN all_nodes t ON t.id = e.to_id
             WHERE e.id > ?1
               AND (?2 IS NULL OR e.scope = ?2)
               AND (?3 IS NULL OR (t.file_path = ?3 AND f.file_path <> ?3))
             ORDER BY e.id LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                after.map_or(0, |id| id.0),
                filter.scope,
                filter.incoming_to_file,
                limit as i64
            ],
            |row| {
                Ok(EdgeRecord {
                    id: EdgeId(row.get(0)?),
                    kind: kind_at(row, 1)?,
                    from: IdentityKey {
                        kind: kind_at(row, 2)?,
                        qualified_name: row.get(3)?,
                        file_path: row.get(4)?,
                    },
                    to: IdentityKey {
                        kind: kind_at(row, 5)?,
                        qualified_name: row.get(6)?,
                        file_path: row.get(7)?,
                    },
                    props: EdgeProps {
                        line_number: row.get(8)?,
                        scope: row.get(9)?,
                        extra: json_at(row, 10)?,
                    },
                })
            },
        )?;
        let mut edges = Vec::new();
        for row in rows {
            edges.push(row?);
        }
        Ok(edges)
    }

    fn stats(&self, scope: Option<&str>) -> Result<GraphStats, BackendError> {
        let conn = self.conn()?;
        let mut stats = GraphStats::default();
        for kind in NodeKind::ALL {
            let count: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE ?1 IS NULL OR scope = ?1",
                    node_table(kind)
                ),
                params![scope],
                |r| r.get(0),
            )?;
            if count > 0 {
                stats.nodes.insert(kind, count as usize);
            }
        }
        for kind in EdgeKind::ALL {
            let count: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} e
                     WHERE (?1 IS NULL OR e.scope = ?1)
                       AND EXISTS (SELECT 1 FROM all_nodes WHERE id = e.from_id)
                       AND EXISTS (SELECT 1 FROM all_nodes WHERE id = e.to_id)",
                    rel_table(kind)
                ),
                params![scope],
                |r| r.get(0),
            )?;
            if count > 0 {
                stats.edges.insert(kind, count as usize);
            }
        }
        Ok(stats)
    }

    fn scopes(&self) -> Result<Vec<String>, BackendError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached("SELECT DISTINCT scope FROM all_nodes ORDER BY scope")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        let mut scopes = Vec::new();
        for row in rows {
            scopes.push(row?);
        }
        Ok(scopes)
    }

    fn close(&self) -> Result<(), BackendError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(location = %self.location, "sqlite backend closed");
        }
        Ok(())
    }
}

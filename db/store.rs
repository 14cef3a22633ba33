// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The event store: a single SQLite connection behind a mutex, caching
//! nothing in RAM beyond what SQLite itself caches. Guardian's write volume
//! (one row per detector firing) doesn't warrant the in-memory recording
//! index the sample-file database keeps; every operation here is a single
//! statement or an explicit transaction.

use crate::model::{Event, EventFilter, Meta, NewEvent, Presence, Severity};
use crate::schema;
use base::{Error, ErrorKind, ResultExt};
use rusqlite::{params, params_from_iter, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

pub struct Store {
    conn: Mutex<Connection>,
}

/// Aggregated counts the gateway folds into `/api/events`'s `summary` field.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct Summary {
    pub by_detector: std::collections::BTreeMap<String, u64>,
    pub by_severity: std::collections::BTreeMap<String, u64>,
    pub by_channel: std::collections::BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub struct ListResult {
    pub items: Vec<Event>,
    pub total: u64,
    pub summary: Summary,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and applies pending
    /// migrations. Failure here is a storage-fatal error: the caller should
    /// abort process startup (§7).
    pub fn open(path: &str) -> Result<Store, Error> {
        let conn = schema::open(path)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inserts a new event, returning the id SQLite assigned. Ids are a
    /// total order consistent with persistence order (§5).
    pub fn insert(&self, e: &NewEvent) -> Result<i64, Error> {
        let mut meta = e.meta.clone();
        crate::model::coerce_pose_forecast(&mut meta.pose_forecast);
        let meta_json = serde_json::to_string(&meta)
            .err_kind(ErrorKind::Internal, "serializing event meta")?;
        let conn = self.lock();
        conn.execute(
            "insert into events (ts, source, detector, severity, message, meta)
             values (?, ?, ?, ?, ?, ?)",
            params![
                e.ts,
                e.source,
                e.detector,
                e.severity.rank() as i64,
                e.message,
                meta_json,
            ],
        )
        .err_kind(ErrorKind::Internal, "inserting event")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get(&self, id: i64) -> Result<Option<Event>, Error> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "select id, ts, source, detector, severity, message, meta from events where id = ?",
                params![id],
                row_to_event,
            )
            .optional_not_found()?;
        Ok(row)
    }

    /// Lists events matching `filter`, newest-first, honoring `limit`
    /// (callers should have already clamped it to `EventFilter::MAX_LIMIT`).
    /// When `filter.min_id` is set, the order flips to ascending `id` — this
    /// is the SSE resume-by-id backlog drain (§4.6, scenario S5), which
    /// must deliver strictly increasing ids.
    pub fn list(&self, filter: &EventFilter) -> Result<ListResult, Error> {
        let (where_clause, args) = build_where(filter);
        let order = if filter.min_id.is_some() {
            "order by id asc"
        } else {
            "order by id desc"
        };
        let limit = filter.limit.clamp(1, EventFilter::MAX_LIMIT);

        let conn = self.lock();
        let sql = format!(
            "select id, ts, source, detector, severity, message, meta from events {where_clause} {order} limit {limit}"
        );
        let mut stmt = conn
            .prepare(&sql)
            .err_kind(ErrorKind::Internal, "preparing list query")?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), row_to_event)
            .err_kind(ErrorKind::Internal, "running list query")?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row.err_kind(ErrorKind::Internal, "reading event row")?);
        }

        let count_sql = format!("select count(*) from events {where_clause}");
        let total: i64 = conn
            .query_row(&count_sql, params_from_iter(args.iter()), |r| r.get(0))
            .err_kind(ErrorKind::Internal, "counting matching events")?;

        let summary = summarize(&items);
        Ok(ListResult {
            items,
            total: total as u64,
            summary,
        })
    }

    /// Deletes events older than `cutoff_ts` (exclusive lower bound: events
    /// with `ts < cutoff_ts` are removed). Returns the count removed.
    pub fn delete_older_than(&self, cutoff_ts: i64) -> Result<u64, Error> {
        let conn = self.lock();
        let n = conn
            .execute("delete from events where ts < ?", params![cutoff_ts])
            .err_kind(ErrorKind::Internal, "deleting expired events")?;
        Ok(n as u64)
    }

    /// Ensures the retention-required indexes exist, returning the ones
    /// actually (re)created so the caller can tell whether the schema
    /// version effectively changed (C4 step 5 / scenario S4).
    pub fn ensure_indexes(&self) -> Result<Vec<&'static str>, Error> {
        let conn = self.lock();
        let mut created = Vec::new();
        for (name, sql) in schema::REQUIRED_INDEXES {
            let existed: bool = conn
                .query_row(
                    "select count(*) from sqlite_master where type = 'index' and name = ?",
                    params![name],
                    |r| r.get::<_, i64>(0),
                )
                .err_kind(ErrorKind::Internal, "checking index existence")?
                > 0;
            conn.execute(sql, params![])
                .err_kind(ErrorKind::Internal, format!("ensuring index {name}"))?;
            if !existed {
                created.push(*name);
                info!(index = name, "rebuilt missing index");
            }
        }
        Ok(created)
    }

    /// Runs the vacuum pipeline described by C4 step 6: checkpoint, optional
    /// reindex/analyze, vacuum, optional `PRAGMA optimize`, then any extra
    /// pragmas in declared order. A failure at any stage is recorded by the
    /// caller as a retention warning and does not abort the run.
    pub fn vacuum(
        &self,
        reindex: bool,
        analyze: bool,
        optimize: bool,
        extra_pragmas: &[String],
    ) -> Result<(), Error> {
        let conn = self.lock();
        conn.execute_batch("pragma wal_checkpoint(truncate)")
            .err_kind(ErrorKind::Internal, "wal checkpoint")?;
        if reindex {
            conn.execute_batch("reindex")
                .err_kind(ErrorKind::Internal, "reindex")?;
        }
        if analyze {
            conn.execute_batch("analyze")
                .err_kind(ErrorKind::Internal, "analyze")?;
        }
        conn.execute_batch("vacuum")
            .err_kind(ErrorKind::Internal, "vacuum")?;
        if optimize {
            conn.execute_batch("pragma optimize")
                .err_kind(ErrorKind::Internal, "pragma optimize")?;
        }
        for pragma in extra_pragmas {
            if pragma.trim().is_empty() {
                continue;
            }
            conn.execute_batch(pragma)
                .err_kind(ErrorKind::Internal, format!("extra pragma {pragma}"))?;
        }
        Ok(())
    }

    /// Current on-disk size of the database file (including WAL/SHM
    /// siblings), used for `diskBefore`/`diskAfter` in retention runs.
    pub fn disk_usage_bytes(&self, path: &Path) -> u64 {
        let mut total = 0u64;
        for suffix in ["", "-wal", "-shm"] {
            let p = format!("{}{}", path.display(), suffix);
            if let Ok(meta) = std::fs::metadata(&p) {
                total += meta.len();
            }
        }
        total
    }
}

fn summarize(items: &[Event]) -> Summary {
    let mut s = Summary::default();
    for e in items {
        *s.by_detector.entry(e.detector.clone()).or_default() += 1;
        *s.by_severity
            .entry(e.severity.as_str().to_string())
            .or_default() += 1;
        if let Some(ch) = e.meta.channel.as_ref() {
            *s.by_channel.entry(ch.clone()).or_default() += 1;
        }
    }
    s
}

fn build_where(filter: &EventFilter) -> (String, Vec<rusqlite::types::Value>) {
    let mut clauses = Vec::new();
    let mut args: Vec<rusqlite::types::Value> = Vec::new();

    if let Some(min_id) = filter.min_id {
        clauses.push("id > ?".to_string());
        args.push(min_id.into());
    }
    if let Some(src) = &filter.source {
        clauses.push("source = ?".to_string());
        args.push(src.clone().into());
    }
    if let Some(det) = &filter.detector {
        clauses.push("detector = ?".to_string());
        args.push(det.clone().into());
    }
    if let Some(sev) = filter.severity {
        clauses.push("severity >= ?".to_string());
        args.push((sev.rank() as i64).into());
    }
    if let Some(from) = filter.from_ts {
        clauses.push("ts >= ?".to_string());
        args.push(from.into());
    }
    if let Some(to) = filter.to_ts {
        clauses.push("ts <= ?".to_string());
        args.push(to.into());
    }
    if !filter.channels.is_empty() {
        let placeholders = filter.channels.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        clauses.push(format!("json_extract(meta, '$.channel') in ({placeholders})"));
        for ch in &filter.channels {
            args.push(ch.clone().into());
        }
    }
    if let Some(cam) = &filter.camera {
        clauses.push("json_extract(meta, '$.camera') = ?".to_string());
        args.push(cam.clone().into());
    }
    match filter.snapshot {
        Some(Presence::With) => clauses.push("json_extract(meta, '$.snapshot') is not null".into()),
        Some(Presence::Without) => clauses.push("json_extract(meta, '$.snapshot') is null".into()),
        None => {}
    }
    match filter.face_snapshot {
        Some(Presence::With) => {
            clauses.push("json_extract(meta, '$.faceSnapshot') is not null".into())
        }
        Some(Presence::Without) => {
            clauses.push("json_extract(meta, '$.faceSnapshot') is null".into())
        }
        None => {}
    }
    if let Some(search) = &filter.search {
        clauses.push(
            "(message like ? escape '\\' or detector like ? escape '\\' or source like ? escape '\\'\
             or json_extract(meta, '$.channel') like ? escape '\\'\
             or json_extract(meta, '$.camera') like ? escape '\\'\
             or json_extract(meta, '$.snapshot') like ? escape '\\')"
                .to_string(),
        );
        let pat = format!("%{}%", escape_like(search));
        for _ in 0..6 {
            args.push(pat.clone().into());
        }
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("where {}", clauses.join(" and "))
    };
    (where_clause, args)
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    let severity_rank: i64 = row.get(4)?;
    let severity = match severity_rank {
        0 => Severity::Info,
        1 => Severity::Warning,
        _ => Severity::Critical,
    };
    let meta_json: String = row.get(6)?;
    let meta: Meta = serde_json::from_str(&meta_json).unwrap_or_default();
    Ok(Event {
        id: row.get(0)?,
        ts: row.get(1)?,
        source: row.get(2)?,
        detector: row.get(3)?,
        severity,
        message: row.get(5)?,
        meta,
    })
}

trait OptionalNotFound<T> {
    fn optional_not_found(self) -> Result<Option<T>, Error>;
}

impl<T> OptionalNotFound<T> for rusqlite::Result<T> {
    fn optional_not_found(self) -> Result<Option<T>, Error> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => {
                warn!(err = %e, "event lookup failed");
                Err(Error::wrap(ErrorKind::Internal, "looking up event", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_event(ts: i64, source: &str, detector: &str, channel: Option<&str>) -> NewEvent {
        NewEvent {
            ts,
            source: source.to_string(),
            detector: detector.to_string(),
            severity: Severity::Info,
            message: format!("{detector} fired"),
            meta: Meta {
                channel: channel.map(str::to_string),
                ..Default::default()
            },
        }
    }

    #[test]
    fn insert_assigns_increasing_ids() {
        let store = Store::open(":memory:").unwrap();
        let id1 = store.insert(&new_event(100, "video:lobby", "motion", Some("video:lobby"))).unwrap();
        let id2 = store.insert(&new_event(50, "video:lobby", "motion", Some("video:lobby"))).unwrap();
        assert!(id2 > id1);
    }

    #[test]
    fn list_filters_by_channel_and_respects_limit() {
        let store = Store::open(":memory:").unwrap();
        for i in 0..3 {
            store
                .insert(&new_event(i, "video:lobby", "motion", Some("video:lobby")))
                .unwrap();
        }
        store
            .insert(&new_event(0, "video:porch", "motion", Some("video:porch")))
            .unwrap();

        let filter = EventFilter {
            channels: vec!["video:lobby".to_string()],
            limit: 2,
            ..Default::default()
        };
        let result = store.list(&filter).unwrap();
        assert_eq!(result.total, 3);
        assert_eq!(result.items.len(), 2);
    }

    #[test]
    fn resume_by_id_returns_ascending_order() {
        let store = Store::open(":memory:").unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(store.insert(&new_event(i, "video:lobby", "motion", Some("video:lobby"))).unwrap());
        }
        let filter = EventFilter {
            min_id: Some(ids[1]),
            limit: 50,
            ..Default::default()
        };
        let result = store.list(&filter).unwrap();
        let got: Vec<i64> = result.items.iter().map(|e| e.id).collect();
        assert_eq!(got, vec![ids[2], ids[3], ids[4]]);
    }

    #[test]
    fn delete_older_than_removes_expired_only() {
        let store = Store::open(":memory:").unwrap();
        store.insert(&new_event(1_000, "video:lobby", "motion", None)).unwrap();
        store.insert(&new_event(9_000, "video:lobby", "motion", None)).unwrap();
        let removed = store.delete_older_than(5_000).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list(&EventFilter { limit: 50, ..Default::default() }).unwrap().total, 1);
    }

    #[test]
    fn insert_coerces_pose_forecast_movement_flags_to_bools() {
        let store = Store::open(":memory:").unwrap();
        let mut e = new_event(0, "video:lobby", "pose", None);
        e.meta.pose_forecast = Some(serde_json::json!({"movementFlags": [1, 0, 1]}));
        let id = store.insert(&e).unwrap();
        let got = store.get(id).unwrap().unwrap();
        assert_eq!(
            got.meta.pose_forecast,
            Some(serde_json::json!({"movementFlags": [true, false, true]}))
        );
    }

    #[test]
    fn ensure_indexes_is_idempotent_and_reports_first_creation() {
        let store = Store::open(":memory:").unwrap();
        // Schema creation already made these; dropping one simulates S4's
        // "index went missing" setup before re-ensuring it.
        store.lock().execute("drop index idx_events_ts", params![]).unwrap();
        let created = store.ensure_indexes().unwrap();
        assert_eq!(created, vec!["idx_events_ts"]);
        let created_again = store.ensure_indexes().unwrap();
        assert!(created_again.is_empty());
    }
}

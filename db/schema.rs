// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2020 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Schema creation and forward-only migration, following the `version`
//! table + ordered-upgraders pattern used for the sample-file database.

use base::{Error, ErrorKind, ResultExt};
use rusqlite::{params, Connection};
use tracing::info;

/// Schema version this binary expects. Bump alongside adding an entry to
/// `UPGRADERS` and a new `ensure_indexes` entry if indexes changed.
pub const EXPECTED_VERSION: i32 = 1;

const INTEGRITY_PRAGMAS: &[&str] = &[
    "pragma journal_mode = wal",
    "pragma foreign_keys = on",
    "pragma synchronous = normal",
];

pub(crate) fn set_integrity_pragmas(conn: &Connection) -> Result<(), Error> {
    for pragma in INTEGRITY_PRAGMAS {
        conn.execute(pragma, params![])
            .err_kind(ErrorKind::Internal, format!("setting pragma {pragma}"))?;
    }
    Ok(())
}

fn init_tables(tx: &rusqlite::Transaction) -> Result<(), Error> {
    tx.execute_batch(
        r#"
        create table version (
            id         integer primary key,
            unix_time  integer not null,
            notes      text not null
        );

        create table events (
            id         integer primary key,
            ts         integer not null,
            source     text not null,
            detector   text not null,
            severity   integer not null,
            message    text not null,
            meta       text not null
        );

        create index idx_events_ts on events (ts);
        create index idx_events_source on events (source);
        create index idx_events_detector on events (detector);
        "#,
    )
    .err_kind(ErrorKind::Internal, "creating schema")?;
    Ok(())
}

/// Opens (creating if necessary) the database at `path`, applying any
/// pending migrations. `path` may be `:memory:` for tests.
pub fn open(path: &str) -> Result<Connection, Error> {
    let mut conn = Connection::open(path)
        .err_kind(ErrorKind::Unavailable, format!("opening database {path}"))?;
    set_integrity_pragmas(&conn)?;

    let has_version: bool = conn
        .query_row(
            "select count(*) from sqlite_master where type = 'table' and name = 'version'",
            params![],
            |row| row.get::<_, i64>(0),
        )
        .err_kind(ErrorKind::Internal, "checking for version table")?
        > 0;

    if !has_version {
        let tx = conn
            .transaction()
            .err_kind(ErrorKind::Internal, "starting init transaction")?;
        init_tables(&tx)?;
        tx.execute(
            "insert into version (id, unix_time, notes) values (?, cast(strftime('%s','now') as integer), ?)",
            params![EXPECTED_VERSION, "initial schema"],
        )
        .err_kind(ErrorKind::Internal, "recording initial version")?;
        tx.commit()
            .err_kind(ErrorKind::Internal, "committing init transaction")?;
        info!(version = EXPECTED_VERSION, "initialized new database");
        return Ok(conn);
    }

    let cur_version: i32 = conn
        .query_row("select max(id) from version", params![], |row| row.get(0))
        .err_kind(ErrorKind::Internal, "reading schema version")?;
    if cur_version > EXPECTED_VERSION {
        return Err(Error::new(
            ErrorKind::DataLoss,
            format!(
                "database is at version {cur_version}, newer than expected {EXPECTED_VERSION}; refusing to open with an older binary"
            ),
        ));
    }
    if cur_version < EXPECTED_VERSION {
        // No migrations defined yet; EXPECTED_VERSION has only ever been 1.
        // A future schema bump adds an UPGRADERS array here, mirroring the
        // sample-file database's v0_to_v1-style modules.
        return Err(Error::new(
            ErrorKind::Internal,
            format!("no migration path from version {cur_version} to {EXPECTED_VERSION}"),
        ));
    }
    Ok(conn)
}

/// The index names the retention engine must ensure exist (C4 step 5).
pub const REQUIRED_INDEXES: &[(&str, &str)] = &[
    (
        "idx_events_ts",
        "create index if not exists idx_events_ts on events (ts)",
    ),
    (
        "idx_events_source",
        "create index if not exists idx_events_source on events (source)",
    ),
    (
        "idx_events_detector",
        "create index if not exists idx_events_detector on events (detector)",
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_fresh_in_memory_db() {
        let conn = open(":memory:").unwrap();
        let ver: i32 = conn
            .query_row("select max(id) from version", params![], |r| r.get(0))
            .unwrap();
        assert_eq!(ver, EXPECTED_VERSION);
    }

    #[test]
    fn required_indexes_are_idempotent() {
        let conn = open(":memory:").unwrap();
        for (_, sql) in REQUIRED_INDEXES {
            conn.execute(sql, params![]).unwrap();
            conn.execute(sql, params![]).unwrap();
        }
    }
}

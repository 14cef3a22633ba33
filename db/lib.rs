// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The durable, queryable event log (§3, §4.4 of the design). This crate
//! owns the SQLite schema and every statement that touches it; callers
//! never see a raw `rusqlite::Connection`.

pub mod model;
pub mod schema;
mod store;

pub use crate::model::{coerce_pose_forecast, Event, EventFilter, Meta, NewEvent, Presence, Severity};
pub use crate::store::{ListResult, Store, Summary};

//! # Persistence Store
//!
//! Contract for the remote data store holding `rides` and `scooters`.
//!
//! Records travel as JSON objects so the same contract fits a PostgREST
//! backend, the local SQLite store and the in-memory store alike. Typed
//! conversion happens in the components that own each table.
//!
//! The one remote procedure the core calls is `nearby_scooters`, taking
//! `{lat, long, max_dist_meters}` and returning scooter records annotated
//! with `dist_meters`, nearest first. [`nearby_scooters`] implements it for
//! stores that hold the scooter table locally.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use log::debug;
use rstar::{RTree, RTreeObject, AABB};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{RideError, Result};
use crate::geo_utils::{haversine_distance, meters_to_degrees};
use crate::GpsPoint;

pub const RIDES_TABLE: &str = "rides";
pub const SCOOTERS_TABLE: &str = "scooters";
pub const NEARBY_SCOOTERS: &str = "nearby_scooters";

/// Row filter for [`PersistenceStore::select_one`].
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `column = value`
    Eq(String, Value),
    /// `column IS NULL` (a missing key counts as null)
    IsNull(String),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(column.to_string(), value.into())
    }

    pub fn is_null(column: &str) -> Self {
        Filter::IsNull(column.to_string())
    }

    /// Whether a JSON record satisfies this filter.
    pub fn matches(&self, record: &Value) -> bool {
        match self {
            Filter::Eq(column, expected) => record.get(column) == Some(expected),
            Filter::IsNull(column) => record.get(column).map_or(true, Value::is_null),
        }
    }
}

/// Remote data store.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Insert a record and return it as stored (with generated fields).
    async fn insert(&self, table: &str, record: Value) -> Result<Value>;

    /// Merge `patch` into the record whose `id` equals `id`.
    async fn update(&self, table: &str, patch: Value, id: i64) -> Result<()>;

    /// First record matching every filter, if any.
    async fn select_one(&self, table: &str, filters: &[Filter]) -> Result<Option<Value>>;

    /// Invoke a named remote procedure.
    async fn call_procedure(&self, name: &str, args: Value) -> Result<Vec<Value>>;
}

// ============================================================================
// Nearby Search
// ============================================================================

/// Arguments of the `nearby_scooters` procedure.
#[derive(Debug, Clone, Deserialize)]
pub struct NearbyArgs {
    pub lat: f64,
    pub long: f64,
    pub max_dist_meters: f64,
}

/// Scooter location wrapper for R-tree indexing.
#[derive(Debug, Clone)]
struct ScooterEntry {
    index: usize,
    lng: f64,
    lat: f64,
}

impl RTreeObject for ScooterEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lng, self.lat])
    }
}

/// Run the `nearby_scooters` procedure over locally held scooter records.
///
/// Records without numeric `lat`/`long` are skipped. Candidates are taken
/// from an R-tree envelope and then filtered by exact haversine distance.
pub fn nearby_scooters(scooters: &[Value], args: &NearbyArgs) -> Vec<Value> {
    let entries: Vec<ScooterEntry> = scooters
        .iter()
        .enumerate()
        .filter_map(|(index, record)| {
            let lat = record.get("lat")?.as_f64()?;
            let lng = record.get("long")?.as_f64()?;
            Some(ScooterEntry { index, lng, lat })
        })
        .collect();
    let tree = RTree::bulk_load(entries);

    let origin = GpsPoint::new(args.lat, args.long);
    let lat_span = meters_to_degrees(args.max_dist_meters);
    // Longitude degrees shrink towards the poles
    let lng_span = lat_span / args.lat.to_radians().cos().abs().max(0.01);

    let mut hits: Vec<(f64, usize)> = search_envelopes(args.long, args.lat, lng_span, lat_span)
        .iter()
        .flat_map(|envelope| tree.locate_in_envelope(envelope))
        .map(|entry| {
            let dist = haversine_distance(&origin, &GpsPoint::new(entry.lat, entry.lng));
            (dist, entry.index)
        })
        .filter(|(dist, _)| *dist <= args.max_dist_meters)
        .collect();
    hits.sort_by(|a, b| a.0.total_cmp(&b.0));

    debug!(
        "[nearby_scooters] {} of {} scooters within {:.0}m",
        hits.len(),
        scooters.len(),
        args.max_dist_meters
    );

    hits.into_iter()
        .map(|(dist, index)| {
            let mut record = scooters[index].clone();
            if let Value::Object(ref mut fields) = record {
                fields.insert("dist_meters".to_string(), Value::from(dist));
            }
            record
        })
        .collect()
}

/// Longitude/latitude boxes covering the search area.
///
/// A box crossing the antimeridian is split in two, one on each side, so
/// the boxes never overlap.
fn search_envelopes(long: f64, lat: f64, lng_span: f64, lat_span: f64) -> Vec<AABB<[f64; 2]>> {
    let (south, north) = (lat - lat_span, lat + lat_span);
    if lng_span >= 180.0 {
        return vec![AABB::from_corners([-180.0, south], [180.0, north])];
    }

    let (west, east) = (long - lng_span, long + lng_span);
    let mut envelopes = vec![AABB::from_corners(
        [west.max(-180.0), south],
        [east.min(180.0), north],
    )];
    if west < -180.0 {
        envelopes.push(AABB::from_corners([west + 360.0, south], [180.0, north]));
    }
    if east > 180.0 {
        envelopes.push(AABB::from_corners([-180.0, south], [east - 360.0, north]));
    }
    envelopes
}

/// Merge the top-level keys of `patch` into `record`.
pub(crate) fn merge_patch(record: &mut Value, patch: Value) -> Result<()> {
    let (Value::Object(fields), Value::Object(changes)) = (record, patch) else {
        return Err(RideError::persistence("records and patches must be JSON objects"));
    };
    for (key, value) in changes {
        fields.insert(key, value);
    }
    Ok(())
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// A call observed by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Insert { table: String, record: Value },
    Update { table: String, patch: Value, id: i64 },
    SelectOne { table: String, filters: Vec<Filter> },
    Procedure { name: String, args: Value },
}

#[derive(Debug, Default)]
struct MemoryTables {
    tables: HashMap<String, Vec<Value>>,
    next_id: i64,
    calls: Vec<StoreCall>,
}

/// In-process store with auto-increment ids.
///
/// Keeps a log of every call so hosts and tests can inspect traffic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a table with records, bypassing the call log.
    pub fn seed(&self, table: &str, records: Vec<Value>) -> Result<()> {
        let mut inner = self.lock()?;
        inner.tables.entry(table.to_string()).or_default().extend(records);
        Ok(())
    }

    /// All records currently held in `table`.
    pub fn records(&self, table: &str) -> Vec<Value> {
        self.lock()
            .map(|inner| inner.tables.get(table).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Every call made so far, oldest first.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().map(|inner| inner.calls.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryTables>> {
        self.inner
            .lock()
            .map_err(|_| RideError::persistence("memory store lock poisoned"))
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn insert(&self, table: &str, record: Value) -> Result<Value> {
        let mut inner = self.lock()?;
        inner.calls.push(StoreCall::Insert {
            table: table.to_string(),
            record: record.clone(),
        });

        let Value::Object(mut fields) = record else {
            return Err(RideError::persistence("records must be JSON objects"));
        };
        if !fields.contains_key("id") {
            inner.next_id += 1;
            fields.insert("id".to_string(), Value::from(inner.next_id));
        }
        let stored = Value::Object(fields);
        inner
            .tables
            .entry(table.to_string())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn update(&self, table: &str, patch: Value, id: i64) -> Result<()> {
        let mut inner = self.lock()?;
        inner.calls.push(StoreCall::Update {
            table: table.to_string(),
            patch: patch.clone(),
            id,
        });

        let record = inner
            .tables
            .get_mut(table)
            .and_then(|rows| {
                rows.iter_mut()
                    .find(|row| row.get("id").and_then(Value::as_i64) == Some(id))
            })
            .ok_or_else(|| RideError::persistence(format!("no {} row with id {}", table, id)))?;
        merge_patch(record, patch)
    }

    async fn select_one(&self, table: &str, filters: &[Filter]) -> Result<Option<Value>> {
        let mut inner = self.lock()?;
        inner.calls.push(StoreCall::SelectOne {
            table: table.to_string(),
            filters: filters.to_vec(),
        });

        Ok(inner.tables.get(table).and_then(|rows| {
            rows.iter()
                .find(|row| filters.iter().all(|f| f.matches(row)))
                .cloned()
        }))
    }

    async fn call_procedure(&self, name: &str, args: Value) -> Result<Vec<Value>> {
        let mut inner = self.lock()?;
        inner.calls.push(StoreCall::Procedure {
            name: name.to_string(),
            args: args.clone(),
        });

        match name {
            NEARBY_SCOOTERS => {
                let args: NearbyArgs = serde_json::from_value(args)
                    .map_err(|e| RideError::persistence(format!("bad {} args: {}", name, e)))?;
                let scooters = inner.tables.get(SCOOTERS_TABLE).cloned().unwrap_or_default();
                Ok(nearby_scooters(&scooters, &args))
            }
            other => Err(RideError::persistence(format!("unknown procedure '{}'", other))),
        }
    }
}

//! In-memory source and destination used by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use docstore_migrate::config::{MigrationOptions, RetryOptions};
use docstore_migrate::retry::Backoff;
use docstore_migrate::{
    DestinationWriter, Error, Page, Record, Result, SourceClient, TableColumns,
};

/// Retry policy with millisecond delays so failing scenarios stay fast.
pub fn fast_options() -> MigrationOptions {
    let retry = RetryOptions {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 5,
        backoff: Backoff::Linear,
        jitter: false,
    };
    MigrationOptions {
        fetch_retry: retry.clone(),
        load_retry: retry,
        ..MigrationOptions::default()
    }
}

/// `count` records `rec-0 .. rec-{count-1}` with fixed audit timestamps.
pub fn records(count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| {
            object(json!({
                "_id": format!("rec-{}", i),
                "nombre": format!("Registro {}", i),
                "_createdDate": "2024-01-15T10:00:00.000Z",
                "_updatedDate": "2024-02-01T12:00:00.000Z",
            }))
        })
        .collect()
}

pub fn object(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {}", other),
    }
}

/// A fetch as seen by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub endpoint: String,
    pub offset: usize,
    pub limit: usize,
}

/// Serves fixed record sets per endpoint, optionally failing some endpoints.
#[derive(Default)]
pub struct ScriptedSource {
    collections: HashMap<String, Vec<Record>>,
    failing: HashSet<String>,
    calls: Mutex<Vec<FetchCall>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, endpoint: &str, records: Vec<Record>) -> Self {
        self.collections.insert(endpoint.to_string(), records);
        self
    }

    /// Every fetch of `endpoint` fails with `SourceUnavailable`.
    pub fn failing(mut self, endpoint: &str) -> Self {
        self.failing.insert(endpoint.to_string());
        self
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, endpoint: &str) -> Vec<FetchCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.endpoint == endpoint)
            .collect()
    }
}

#[async_trait]
impl SourceClient for ScriptedSource {
    async fn fetch_page(&self, endpoint: &str, offset: usize, limit: usize) -> Result<Page> {
        self.calls.lock().unwrap().push(FetchCall {
            endpoint: endpoint.to_string(),
            offset,
            limit,
        });

        if self.failing.contains(endpoint) {
            return Err(Error::SourceUnavailable(format!("HTTP 503: {}", endpoint)));
        }

        let all = self.collections.get(endpoint).cloned().unwrap_or_default();
        Ok(Page::new(all.into_iter().skip(offset).take(limit).collect()))
    }
}

/// Keeps upserted rows per table, keyed on the primary key.
#[derive(Default)]
pub struct RecordingDestination {
    tables: Mutex<BTreeMap<String, BTreeMap<String, Record>>>,
    columns: HashMap<String, TableColumns>,
    failing_keys: HashSet<String>,
    unreachable: bool,
    upsert_attempts: AtomicUsize,
    column_lookups: AtomicUsize,
}

impl RecordingDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns(mut self, table: &str, names: &[&str]) -> Self {
        let columns = names
            .iter()
            .map(|n| ((*n).to_string(), "text".to_string()))
            .collect();
        self.columns.insert(table.to_string(), columns);
        self
    }

    /// Any batch containing this key fails with `DestinationUnavailable`.
    pub fn failing_on(mut self, key: &str) -> Self {
        self.failing_keys.insert(key.to_string());
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn rows(&self, table: &str) -> BTreeMap<String, Record> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn upsert_attempts(&self) -> usize {
        self.upsert_attempts.load(Ordering::SeqCst)
    }

    pub fn column_lookups(&self) -> usize {
        self.column_lookups.load(Ordering::SeqCst)
    }
}

fn key_of(record: &Record, primary_key: &str) -> String {
    match record.get(primary_key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[async_trait]
impl DestinationWriter for RecordingDestination {
    async fn ping(&self) -> Result<()> {
        if self.unreachable {
            return Err(Error::DestinationUnavailable("connection refused".to_string()));
        }
        Ok(())
    }

    async fn table_columns(&self, table: &str) -> Result<TableColumns> {
        self.column_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.columns.get(table).cloned().unwrap_or_default())
    }

    async fn upsert_batch(
        &self,
        table: &str,
        primary_key: &str,
        records: &[Record],
        _columns: &TableColumns,
    ) -> Result<u64> {
        self.upsert_attempts.fetch_add(1, Ordering::SeqCst);

        if records
            .iter()
            .any(|r| self.failing_keys.contains(&key_of(r, primary_key)))
        {
            return Err(Error::DestinationUnavailable(
                "deadlock detected".to_string(),
            ));
        }

        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(table.to_string()).or_default();
        for record in records {
            rows.insert(key_of(record, primary_key), record.clone());
        }
        Ok(records.len() as u64)
    }
}

//! Per-collection fetch / transform / load loop.
//!
//! One [`Exporter`] drives one collection from the source API to its
//! destination table, a page at a time, with no concurrency inside the
//! collection. Failures never escape `run`: an exhausted fetch ends the
//! collection, an exhausted load fails only that batch, and both show up as
//! `total_failed` in the returned [`MigrationResult`].

use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::MigrationOptions;
use crate::destination::{DestinationWriter, TableColumns};
use crate::error::Result;
use crate::registry::CollectionDescriptor;
use crate::retry::{with_retry, RetryConfig};
use crate::source::{Page, Record, SourceClient};
use crate::transform::Transformer;

/// Options for a single exporter run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// Fetch and transform but never write.
    pub simulate: bool,
    /// Stop once this many records have been processed.
    pub max_records: Option<usize>,
}

/// Outcome of one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Collection name.
    pub collection: String,
    /// Records fetched and transformed.
    pub total_processed: u64,
    /// Rows reported written by successful upserts (insert or update).
    pub total_written: u64,
    /// Records that could not be fetched or written.
    pub total_failed: u64,
    /// Pages fetched.
    pub batches: u64,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// `total_failed == 0`.
    pub success: bool,
    /// Whether this run skipped all writes.
    pub simulated: bool,
}

impl MigrationResult {
    fn new(collection: &str, simulated: bool) -> Self {
        Self {
            collection: collection.to_string(),
            simulated,
            ..Self::default()
        }
    }

    /// Records processed per second.
    #[must_use]
    pub fn throughput(&self) -> f64 {
        if self.duration_ms > 0 {
            self.total_processed as f64 * 1000.0 / self.duration_ms as f64
        } else {
            0.0
        }
    }
}

/// A transformed page ready for the writer.
#[derive(Debug, Default)]
pub struct PreparedBatch {
    /// Rows to upsert, one per distinct primary key.
    pub rows: Vec<Record>,
    /// Records represented by `rows` (duplicates included).
    pub accepted: u64,
    /// Records dropped for lacking a primary key.
    pub rejected: u64,
    /// Fields removed because the table has no such column.
    pub dropped_fields: BTreeSet<String>,
}

/// Drops keyless records, filters the rest to known columns and collapses
/// duplicate keys to their last occurrence.
///
/// The primary key is read before filtering and always kept. `columns` of
/// `None` or an empty map disables column filtering.
pub fn prepare_batch(
    records: Vec<Record>,
    primary_key: &str,
    columns: Option<&TableColumns>,
) -> PreparedBatch {
    let filter = columns.filter(|c| !c.is_empty());
    let mut batch = PreparedBatch::default();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for mut record in records {
        let key = match record.get(primary_key) {
            None | Some(Value::Null) => {
                batch.rejected += 1;
                continue;
            }
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };

        if let Some(columns) = filter {
            record.retain(|field, _| {
                let known = field == primary_key || columns.contains_key(field);
                if !known {
                    batch.dropped_fields.insert(field.clone());
                }
                known
            });
        }

        batch.accepted += 1;
        match positions.get(&key) {
            Some(&index) => batch.rows[index] = record,
            None => {
                positions.insert(key, batch.rows.len());
                batch.rows.push(record);
            }
        }
    }

    batch
}

/// Migrates one collection.
pub struct Exporter {
    descriptor: CollectionDescriptor,
    source: Arc<dyn SourceClient>,
    destination: Arc<dyn DestinationWriter>,
    transformer: Transformer,
    fetch_retry: RetryConfig,
    load_retry: RetryConfig,
    progress: ProgressBar,
}

impl Exporter {
    /// Creates the exporter for `descriptor`.
    pub fn new(
        descriptor: CollectionDescriptor,
        source: Arc<dyn SourceClient>,
        destination: Arc<dyn DestinationWriter>,
        options: &MigrationOptions,
    ) -> Self {
        let transformer = Transformer::new(&descriptor, options);
        Self {
            descriptor,
            source,
            destination,
            transformer,
            fetch_retry: RetryConfig::from(&options.fetch_retry),
            load_retry: RetryConfig::from(&options.load_retry),
            progress: ProgressBar::hidden(),
        }
    }

    /// Reports per-record progress on `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// The collection this exporter migrates.
    pub fn descriptor(&self) -> &CollectionDescriptor {
        &self.descriptor
    }

    /// Runs the collection to completion or to a partial-failure state.
    #[allow(clippy::cognitive_complexity)] // Reason: the batch loop is one sequential state machine
    pub async fn run(&self, options: ExportOptions) -> MigrationResult {
        let start = Instant::now();
        let name = self.descriptor.name.as_str();
        let batch_size = self.descriptor.batch_size;
        let delay = Duration::from_millis(self.descriptor.inter_batch_delay_ms);

        let mut result = MigrationResult::new(name, options.simulate);
        let mut offset = 0usize;
        let mut processed = 0usize;
        let mut columns: Option<TableColumns> = None;
        let mut reported_drops: BTreeSet<String> = BTreeSet::new();

        info!(
            "{}: starting ({} -> {}, batch size {})",
            name, self.descriptor.source_endpoint, self.descriptor.destination_table, batch_size
        );

        loop {
            let limit = match options.max_records {
                Some(max) => batch_size.min(max.saturating_sub(processed)),
                None => batch_size,
            };
            if limit == 0 {
                break;
            }

            let page = match self.fetch(offset, limit).await {
                Ok(page) => page,
                Err(e) => {
                    error!(
                        "{}: source unavailable at offset {}, abandoning collection: {}",
                        name, offset, e
                    );
                    result.total_failed += limit as u64;
                    break;
                }
            };

            if page.is_empty() {
                debug!("{}: empty page at offset {}, done", name, offset);
                break;
            }

            let fetched = page.fetched;
            result.batches += 1;
            result.total_processed += fetched as u64;
            processed += fetched;

            let malformed = page.malformed();
            if malformed > 0 {
                warn!(
                    "{}: {} non-object entries at offset {} counted as failed",
                    name, malformed, offset
                );
                result.total_failed += malformed as u64;
            }

            let records = self.transformer.transform_batch(page.records);
            let well_formed = records.len() as u64;

            if options.simulate {
                let batch = prepare_batch(records, &self.descriptor.primary_key, None);
                result.total_failed += batch.rejected;
                debug!(
                    "{}: [dry run] batch {} would upsert {} rows",
                    name,
                    result.batches,
                    batch.rows.len()
                );
            } else {
                if columns.is_none() {
                    match self.discover_columns().await {
                        Ok(discovered) => columns = Some(discovered),
                        Err(e) => {
                            error!(
                                "{}: could not load columns of {}, batch {} failed: {}",
                                name, self.descriptor.destination_table, result.batches, e
                            );
                            result.total_failed += well_formed;
                        }
                    }
                }

                if let Some(columns) = &columns {
                    self.load(records, columns, &mut reported_drops, &mut result)
                        .await;
                }
            }

            self.progress.inc(fetched as u64);
            offset += fetched;

            if fetched < limit {
                debug!("{}: short page ({} < {}), done", name, fetched, limit);
                break;
            }
            if options.max_records.is_some_and(|max| processed >= max) {
                info!("{}: reached max of {} records", name, processed);
                break;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        result.success = result.total_failed == 0;

        if result.success {
            info!(
                "{}: {} processed, {} written in {} ms",
                name, result.total_processed, result.total_written, result.duration_ms
            );
        } else {
            warn!(
                "{}: {} processed, {} written, {} failed in {} ms",
                name,
                result.total_processed,
                result.total_written,
                result.total_failed,
                result.duration_ms
            );
        }

        result
    }

    async fn fetch(&self, offset: usize, limit: usize) -> Result<Page> {
        let op = format!("fetch {} @{}", self.descriptor.name, offset);
        let endpoint = self.descriptor.source_endpoint.as_str();
        with_retry(&self.fetch_retry, &op, || {
            self.source.fetch_page(endpoint, offset, limit)
        })
        .await
    }

    async fn discover_columns(&self) -> Result<TableColumns> {
        let table = self.descriptor.destination_table.as_str();
        let op = format!("columns {}", table);
        let columns =
            with_retry(&self.load_retry, &op, || self.destination.table_columns(table)).await?;

        if columns.is_empty() {
            warn!(
                "{}: table {} reports no columns, writing fields unfiltered",
                self.descriptor.name, table
            );
        } else if !columns.contains_key(&self.descriptor.primary_key) {
            error!(
                "{}: table {} has no primary key column '{}', no batch can be written",
                self.descriptor.name, table, self.descriptor.primary_key
            );
        } else {
            debug!("{}: {} has {} columns", self.descriptor.name, table, columns.len());
        }
        Ok(columns)
    }

    async fn load(
        &self,
        records: Vec<Record>,
        columns: &TableColumns,
        reported_drops: &mut BTreeSet<String>,
        result: &mut MigrationResult,
    ) {
        let name = self.descriptor.name.as_str();
        let primary_key = self.descriptor.primary_key.as_str();
        let table = self.descriptor.destination_table.as_str();

        if !columns.is_empty() && !columns.contains_key(primary_key) {
            result.total_failed += records.len() as u64;
            return;
        }

        let batch = prepare_batch(records, primary_key, Some(columns));

        for field in &batch.dropped_fields {
            if reported_drops.insert(field.clone()) {
                warn!("{}: dropping field '{}' (no column in {})", name, field, table);
            }
        }
        if batch.rejected > 0 {
            warn!(
                "{}: {} records without '{}' skipped",
                name, batch.rejected, primary_key
            );
            result.total_failed += batch.rejected;
        }
        if batch.rows.is_empty() {
            return;
        }

        let op = format!("upsert {} batch {}", table, result.batches);
        let rows = &batch.rows;
        match with_retry(&self.load_retry, &op, || {
            self.destination
                .upsert_batch(table, primary_key, rows, columns)
        })
        .await
        {
            Ok(written) => {
                debug!("{}: batch {} wrote {} rows", name, result.batches, written);
                result.total_written += written;
            }
            Err(e) => {
                error!(
                    "{}: destination unavailable, batch {} ({} records) failed: {}",
                    name, result.batches, batch.accepted, e
                );
                result.total_failed += batch.accepted;
            }
        }
    }
}

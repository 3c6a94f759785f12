//! Migration orchestration across collections.
//!
//! Runs one exporter per selected collection, strictly in registry order.
//! A collection ending in partial failure stops a real run, since later
//! collections may refer to its rows; a dry run keeps going so every
//! collection's problems show up in one pass.

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::{MigrationConfig, MigrationOptions};
use crate::destination::{DestinationWriter, PgDestination};
use crate::error::{Error, Result};
use crate::exporter::{ExportOptions, Exporter};
use crate::registry::CollectionRegistry;
use crate::report::MigrationReport;
use crate::source::{HttpSourceClient, SourceClient};

/// Options for an orchestrated run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Fetch and transform, never write, never halt.
    pub simulate: bool,
    /// Restrict the run to this collection.
    pub only: Option<String>,
    /// Exclude this collection.
    pub skip: Option<String>,
    /// Per-collection cap on processed records.
    pub max_records: Option<usize>,
}

/// Where the run currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunPhase {
    /// Resolving the working set.
    Init,
    /// Checking destination connectivity.
    Connecting,
    /// Migrating the named collection.
    Running(String),
    /// Producing the final report.
    Summary,
}

/// Migration orchestrator.
pub struct Orchestrator {
    registry: CollectionRegistry,
    options: MigrationOptions,
    source: Arc<dyn SourceClient>,
    destination: Arc<dyn DestinationWriter>,
    show_progress: bool,
    phase: RunPhase,
}

impl Orchestrator {
    /// Creates an orchestrator over explicit source and destination ports.
    pub fn new(
        registry: CollectionRegistry,
        options: MigrationOptions,
        source: Arc<dyn SourceClient>,
        destination: Arc<dyn DestinationWriter>,
    ) -> Self {
        Self {
            registry,
            options,
            source,
            destination,
            show_progress: false,
            phase: RunPhase::Init,
        }
    }

    /// Builds the HTTP source and `PostgreSQL` destination from configuration.
    ///
    /// No connection is opened until [`Orchestrator::run`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn from_config(config: &MigrationConfig) -> Result<Self> {
        config.validate()?;
        let registry = config.registry()?;
        let source = HttpSourceClient::new(&config.source)?;
        let destination = PgDestination::connect_lazy(&config.destination)?;

        Ok(Self::new(
            registry,
            config.options.clone(),
            Arc::new(source),
            Arc::new(destination),
        ))
    }

    /// Shows a spinner per collection.
    #[must_use]
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// The registry this orchestrator runs from.
    pub fn registry(&self) -> &CollectionRegistry {
        &self.registry
    }

    /// Current phase.
    pub fn phase(&self) -> &RunPhase {
        &self.phase
    }

    fn enter(&mut self, phase: RunPhase) {
        match &phase {
            RunPhase::Init => info!("Resolving collections"),
            RunPhase::Connecting => info!("Checking destination connectivity"),
            RunPhase::Running(name) => info!("Migrating {}", name),
            RunPhase::Summary => info!("Building summary"),
        }
        self.phase = phase;
    }

    /// Runs the selected collections in migration order.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownCollection` for a bad filter and
    /// `Error::DestinationUnreachable` when the connectivity check fails; both
    /// happen before any collection runs. Collection failures are reported in
    /// the returned [`MigrationReport`], never as errors.
    pub async fn run(&mut self, options: &RunOptions) -> Result<MigrationReport> {
        let started_at = Utc::now();
        let start = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();

        self.enter(RunPhase::Init);
        let selected: Vec<_> = self
            .registry
            .resolve(options.only.as_deref(), options.skip.as_deref())?
            .into_iter()
            .cloned()
            .collect();
        info!(
            "Run {}: {} collection(s){}: {}",
            run_id,
            selected.len(),
            if options.simulate { " [dry run]" } else { "" },
            selected
                .iter()
                .map(|d| d.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.enter(RunPhase::Connecting);
        self.destination.ping().await.map_err(|e| match e {
            Error::DestinationUnreachable(_) => e,
            other => Error::DestinationUnreachable(other.to_string()),
        })?;

        let export_options = ExportOptions {
            simulate: options.simulate,
            max_records: options.max_records,
        };

        let mut results = Vec::with_capacity(selected.len());
        let mut halted_at = None;
        let mut not_run = Vec::new();

        for (index, descriptor) in selected.iter().enumerate() {
            self.enter(RunPhase::Running(descriptor.name.clone()));

            let progress = create_progress_bar(self.show_progress, &descriptor.name);
            let exporter = Exporter::new(
                descriptor.clone(),
                Arc::clone(&self.source),
                Arc::clone(&self.destination),
                &self.options,
            )
            .with_progress(progress.clone());

            let result = exporter.run(export_options).await;
            progress.finish_with_message(format!(
                "{} {}",
                descriptor.name,
                if result.success { "done" } else { "failed" }
            ));

            let failed = !result.success;
            results.push(result);

            if failed && !options.simulate {
                warn!(
                    "{} ended in partial failure, halting before {} remaining collection(s)",
                    descriptor.name,
                    selected.len() - index - 1
                );
                halted_at = Some(descriptor.name.clone());
                not_run = selected[index + 1..]
                    .iter()
                    .map(|d| d.name.clone())
                    .collect();
                break;
            }
        }

        self.enter(RunPhase::Summary);
        let report = MigrationReport {
            run_id,
            started_at,
            completed_at: Utc::now(),
            simulated: options.simulate,
            results,
            halted_at,
            not_run,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            "Migration finished: {} processed, {} written, {} failed in {:.2}s ({:.0} rec/sec)",
            report.total_processed(),
            report.total_written(),
            report.total_failed(),
            report.duration_ms as f64 / 1000.0,
            report.throughput()
        );

        Ok(report)
    }
}

fn create_progress_bar(show: bool, collection: &str) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg} {pos} records ({per_sec})")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(collection.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(120));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_options_default() {
        let options = RunOptions::default();
        assert!(!options.simulate);
        assert!(options.only.is_none());
        assert!(options.skip.is_none());
        assert!(options.max_records.is_none());
    }

    #[test]
    fn test_hidden_progress_bar() {
        let pb = create_progress_bar(false, "NIVELES");
        assert!(pb.is_hidden());
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let config = MigrationConfig::from_urls("ftp://nope", "postgres://localhost/app");
        assert!(Orchestrator::from_config(&config).is_err());
    }
}

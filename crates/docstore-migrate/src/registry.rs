//! Collection registry: what to migrate, where to, and in which order.
//!
//! Every collection is described once by a [`CollectionDescriptor`]. The
//! registry keeps them sorted by `migration_rank`; catalogs that other
//! collections refer to carry lower ranks so they land first. The ordering is
//! a convention over soft references and nothing here checks referential
//! integrity.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::error::{Error, Result};

/// Default primary key field of every source document.
pub const DEFAULT_PRIMARY_KEY: &str = "_id";

/// Static per-collection migration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    /// Logical collection name (e.g. `NIVELES`).
    pub name: String,
    /// Path appended to the source base URL (must start with `/`).
    pub source_endpoint: String,
    /// Destination table.
    pub destination_table: String,
    /// Field that uniquely identifies a record; the upsert conflict target.
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    /// Page size requested from the source.
    pub batch_size: usize,
    /// Pause between two page fetches.
    #[serde(default)]
    pub inter_batch_delay_ms: u64,
    /// Fields stored as JSON text; missing or null ones default to `"[]"`.
    #[serde(default)]
    pub json_fields: BTreeSet<String>,
    /// Collection-specific date fields, normalized alongside the audit timestamps.
    #[serde(default)]
    pub date_fields: BTreeSet<String>,
    /// Source field -> destination column renames.
    #[serde(default)]
    pub field_mappings: BTreeMap<String, String>,
    /// Position in the migration order (lower runs first).
    pub migration_rank: u32,
}

fn default_primary_key() -> String {
    DEFAULT_PRIMARY_KEY.to_string()
}

impl CollectionDescriptor {
    /// Creates a descriptor with no JSON fields, date fields or renames.
    pub fn new(
        name: impl Into<String>,
        source_endpoint: impl Into<String>,
        destination_table: impl Into<String>,
        batch_size: usize,
        migration_rank: u32,
    ) -> Self {
        Self {
            name: name.into(),
            source_endpoint: source_endpoint.into(),
            destination_table: destination_table.into(),
            primary_key: default_primary_key(),
            batch_size,
            inter_batch_delay_ms: 0,
            json_fields: BTreeSet::new(),
            date_fields: BTreeSet::new(),
            field_mappings: BTreeMap::new(),
            migration_rank,
        }
    }

    /// Sets the inter-batch delay.
    #[must_use]
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.inter_batch_delay_ms = delay_ms;
        self
    }

    /// Adds fields that must be serialized to JSON text.
    #[must_use]
    pub fn with_json_fields(mut self, fields: &[&str]) -> Self {
        self.json_fields
            .extend(fields.iter().map(|f| (*f).to_string()));
        self
    }

    /// Adds collection-specific date fields.
    #[must_use]
    pub fn with_date_fields(mut self, fields: &[&str]) -> Self {
        self.date_fields
            .extend(fields.iter().map(|f| (*f).to_string()));
        self
    }

    /// Adds a source -> destination field rename.
    #[must_use]
    pub fn with_mapping(mut self, from: &str, to: &str) -> Self {
        self.field_mappings.insert(from.to_string(), to.to_string());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("collection name cannot be empty".to_string()));
        }
        if !self.source_endpoint.starts_with('/') {
            return Err(Error::Config(format!(
                "collection {}: source_endpoint '{}' must start with '/'",
                self.name, self.source_endpoint
            )));
        }
        if self.destination_table.trim().is_empty() {
            return Err(Error::Config(format!(
                "collection {}: destination_table cannot be empty",
                self.name
            )));
        }
        if self.primary_key.trim().is_empty() {
            return Err(Error::Config(format!(
                "collection {}: primary_key cannot be empty",
                self.name
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Config(format!(
                "collection {}: batch_size must be greater than 0",
                self.name
            )));
        }
        Ok(())
    }
}

/// Immutable, rank-ordered set of collection descriptors.
#[derive(Debug, Clone)]
pub struct CollectionRegistry {
    collections: Vec<CollectionDescriptor>,
}

impl CollectionRegistry {
    /// Builds a registry from descriptors, validating and ordering them by rank.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid descriptor, a duplicate name or a
    /// duplicate rank.
    pub fn new(mut collections: Vec<CollectionDescriptor>) -> Result<Self> {
        if collections.is_empty() {
            return Err(Error::Config("registry has no collections".to_string()));
        }

        let mut names = HashSet::new();
        let mut ranks = HashSet::new();
        for descriptor in &collections {
            descriptor.validate()?;
            if !names.insert(descriptor.name.to_ascii_uppercase()) {
                return Err(Error::Config(format!(
                    "duplicate collection name '{}'",
                    descriptor.name
                )));
            }
            if !ranks.insert(descriptor.migration_rank) {
                return Err(Error::Config(format!(
                    "duplicate migration_rank {} (collection {})",
                    descriptor.migration_rank, descriptor.name
                )));
            }
        }

        collections.sort_by_key(|d| d.migration_rank);
        Ok(Self { collections })
    }

    /// The built-in catalog of collections.
    #[must_use]
    pub fn builtin() -> Self {
        let mut collections = builtin_collections();
        collections.sort_by_key(|d| d.migration_rank);
        Self { collections }
    }

    /// Looks up a collection by name (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownCollection` if no collection has that name.
    pub fn describe(&self, name: &str) -> Result<&CollectionDescriptor> {
        self.collections
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))
    }

    /// Collection names in migration order.
    #[must_use]
    pub fn migration_order(&self) -> Vec<&str> {
        self.collections.iter().map(|d| d.name.as_str()).collect()
    }

    /// Descriptors in migration order.
    pub fn iter(&self) -> impl Iterator<Item = &CollectionDescriptor> {
        self.collections.iter()
    }

    /// Number of registered collections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.collections.len()
    }

    /// Whether the registry is empty (never true for a constructed registry).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Resolves the working set for a run, in migration order.
    ///
    /// `only` narrows to one collection, `skip` removes one. Both must name a
    /// registered collection.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownCollection` for an unrecognized filter value.
    pub fn resolve(
        &self,
        only: Option<&str>,
        skip: Option<&str>,
    ) -> Result<Vec<&CollectionDescriptor>> {
        let skipped = skip.map(|name| self.describe(name)).transpose()?;

        let selected: Vec<&CollectionDescriptor> = match only {
            Some(name) => vec![self.describe(name)?],
            None => self.collections.iter().collect(),
        };

        Ok(selected
            .into_iter()
            .filter(|d| skipped.map_or(true, |s| s.name != d.name))
            .collect())
    }
}

impl Default for CollectionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin_collections() -> Vec<CollectionDescriptor> {
    vec![
        CollectionDescriptor::new("NIVELES", "/niveles", "niveles", 100, 1).with_delay_ms(100),
        CollectionDescriptor::new("STEPS", "/steps", "steps", 100, 2)
            .with_delay_ms(100)
            .with_json_fields(&["materiales", "clubs"]),
        CollectionDescriptor::new("ADVISORS", "/advisors", "advisors", 50, 3)
            .with_delay_ms(200)
            .with_json_fields(&["disponibilidad"])
            .with_date_fields(&["fechaIngreso"]),
        CollectionDescriptor::new("USUARIOS_ROLES", "/usuarios-roles", "usuarios_roles", 100, 4)
            .with_delay_ms(100)
            .with_json_fields(&["permisos"]),
        CollectionDescriptor::new("PEOPLE", "/people", "people", 200, 5)
            .with_delay_ms(300)
            .with_json_fields(&["beneficiarios", "documentos"])
            .with_date_fields(&["fechaNacimiento", "fechaContrato", "finalContrato"]),
        CollectionDescriptor::new("ACADEMICA", "/academica", "academica", 200, 6)
            .with_delay_ms(300)
            .with_json_fields(&["extensionHistory", "onHoldHistory", "stepsAprobados"])
            .with_date_fields(&["fechaNacimiento", "inicioCurso", "finalCurso", "fechaOnHold"]),
        CollectionDescriptor::new("FINANCIEROS", "/financieros", "financieros", 200, 7)
            .with_delay_ms(300)
            .with_json_fields(&["cuotas", "pagos"])
            .with_date_fields(&["fechaPago", "vigencia"]),
        CollectionDescriptor::new("CONTRATOS", "/contratos", "contratos", 100, 8)
            .with_delay_ms(200)
            .with_json_fields(&["firmas", "clausulas"])
            .with_date_fields(&["fechaFirma"]),
        CollectionDescriptor::new("CALENDARIO", "/calendario", "calendario", 100, 9)
            .with_delay_ms(200)
            .with_json_fields(&["inscritos"])
            .with_date_fields(&["dia"]),
        CollectionDescriptor::new(
            "ACADEMICA_BOOKINGS",
            "/academica-bookings",
            "academica_bookings",
            500,
            10,
        )
        .with_delay_ms(500)
        .with_date_fields(&["fechaEvento"])
        .with_mapping("eventoId", "idEvento"),
        CollectionDescriptor::new("COMENTARIOS", "/comentarios", "comentarios", 200, 11)
            .with_delay_ms(200)
            .with_date_fields(&["fecha"]),
        CollectionDescriptor::new("MESSAGE_LOG", "/message-log", "message_log", 500, 12)
            .with_delay_ms(500)
            .with_json_fields(&["payload"])
            .with_date_fields(&["fechaEnvio"]),
    ]
}

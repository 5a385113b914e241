//! The store: sole owner of the record set and the only writer of the
//! persisted container and its backups.
//!
//! Reads clone an `Arc` of the current [`StoreState`] and never block on a
//! writer for longer than that clone. Every mutation takes the write gate,
//! builds the next state, snapshots the persisted container, saves the new
//! one and only then swaps the in-memory state. If the snapshot or the save
//! fails the old state stays in place and the caller gets a
//! `PersistenceError`.
//!
//! Collaborators (classifier, quality analyzer) are always consulted before
//! the write gate is taken.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collaborators::{Classification, Collaborators};
use crate::config::StoreConfig;
use crate::error::{StorageError, StoreError, ValidationError, Warning, WarningKind};
use crate::identity::{self, Resolution};
use crate::merge::{self, Merged};
use crate::migration::{self, MigrationResult};
use crate::schema::{self, SCHEMA_VERSION};
use crate::storage::{BackupHandle, Storage, EMPTY_CONTAINER};
use crate::supplement_model::{
    CandidateRecord, Category, Field, Provenance, QualityReport, Source, SupplementRecord,
};

/// Result of a mutating call that succeeded, possibly in degraded form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Written<T> {
    pub data: T,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
}

impl<T> Written<T> {
    pub fn clean(data: T) -> Self {
        Written {
            data,
            warnings: Vec::new(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchQuery {
    /// Case-insensitive substring over name, brand and ingredient names.
    pub text: Option<String>,
    pub category: Option<Category>,
    pub brand: Option<String>,
    pub verified: Option<bool>,
    pub offset: usize,
    /// Defaults to the configured page size and is capped at its maximum.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    pub items: Vec<SupplementRecord>,
    /// Matches before pagination.
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total: usize,
    pub verified: usize,
    pub with_barcode: usize,
    pub by_category: BTreeMap<Category, usize>,
    pub by_source: BTreeMap<Source, usize>,
    pub last_updated: Option<DateTime<Utc>>,
    /// Stored values kept verbatim because they could not be migrated.
    pub unmigrated: usize,
}

/// Immutable view of the record set shared with readers.
#[derive(Debug, Default)]
struct StoreState {
    records: Vec<SupplementRecord>,
    unmigrated: Vec<Value>,
}

impl StoreState {
    fn with_records(&self, records: Vec<SupplementRecord>) -> StoreState {
        StoreState {
            records,
            unmigrated: self.unmigrated.clone(),
        }
    }
}

/// Where a `get_or_create` candidate lands.
enum Placement {
    Existing(usize),
    BackfillBarcode(usize),
    Create,
}

pub struct SupplementStore {
    storage: Box<dyn Storage>,
    config: StoreConfig,
    collaborators: Collaborators,
    state: RwLock<Arc<StoreState>>,
    write_gate: Mutex<()>,
}

impl SupplementStore {
    /// Opens the storage named by `config` and initializes a store on it with
    /// the built-in collaborators.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Self::open_with(config, Collaborators::default())
    }

    pub fn open_with(config: StoreConfig, collaborators: Collaborators) -> Result<Self, StoreError> {
        let storage = config.open_storage().map_err(|e| {
            StoreError::Initialization(format!("cannot open {}: {e}", config.path.display()))
        })?;
        Self::initialize(storage, config, collaborators)
    }

    /// Loads (creating if absent) the container, migrates it and prunes old
    /// backups. Any failure here is an `InitializationError`.
    pub fn initialize(
        storage: Box<dyn Storage>,
        config: StoreConfig,
        collaborators: Collaborators,
    ) -> Result<Self, StoreError> {
        let init = |what: &str, e: &dyn std::fmt::Display| {
            StoreError::Initialization(format!("{what}: {e}"))
        };

        let raw = match storage.load().map_err(|e| init("cannot read container", &e))? {
            Some(bytes) => decode_container(&bytes)?,
            None => {
                info!("No container found, creating an empty one");
                storage
                    .save(EMPTY_CONTAINER)
                    .map_err(|e| init("cannot create container", &e))?;
                Vec::new()
            }
        };

        let outcome = migration::migrate_batch(raw, collaborators.classifier.as_ref(), Utc::now());
        let state = StoreState {
            records: outcome.records,
            unmigrated: outcome.unmigrated,
        };
        if outcome.migrated_count > 0 {
            let bytes = encode(&state).map_err(|e| init("cannot encode migrated records", &e))?;
            let backup = storage
                .snapshot()
                .map_err(|e| init("cannot back up before migration", &e))?;
            storage
                .save(&bytes)
                .map_err(|e| init("cannot write migrated records", &e))?;
            info!(
                "Migrated {} records to schema v{SCHEMA_VERSION} (backup at {})",
                outcome.migrated_count, backup.location
            );
        }
        info!(
            "Store initialized with {} records, {} kept unmigrated",
            state.records.len(),
            state.unmigrated.len()
        );

        let store = SupplementStore {
            storage,
            config,
            collaborators,
            state: RwLock::new(Arc::new(state)),
            write_gate: Mutex::new(()),
        };
        store.prune_backups();
        Ok(store)
    }

    /// Returns the record for `barcode` if one exists. Otherwise resolves
    /// `candidate` by identity: an existing match is reused (gaining the
    /// barcode if it had none) and a miss creates a new record.
    pub fn get_or_create(
        &self,
        barcode: Option<&str>,
        candidate: Option<CandidateRecord>,
    ) -> Result<Written<SupplementRecord>, StoreError> {
        let barcode = clean_barcode(barcode);
        if let Some(code) = barcode.as_deref() {
            if let Some(record) = self.find_by_barcode(code) {
                return Ok(Written::clean(record));
            }
        }

        let Some(mut candidate) = candidate else {
            return Err(StoreError::NotFound(match barcode {
                Some(code) => format!("no record with barcode {code}"),
                None => "no barcode or candidate supplied".to_string(),
            }));
        };
        reject_combined_source(&candidate)?;
        candidate.barcode = barcode.or_else(|| clean_barcode(candidate.barcode.as_deref()));

        let mut prepared = None;
        loop {
            if prepared.is_none() {
                let (placement, _) = plan_placement(&self.snapshot().records, &candidate);
                if matches!(placement, Placement::Create) {
                    prepared = Some(self.prepare_new(&candidate));
                }
            }

            let _gate = self.write_gate.lock();
            let current = self.snapshot();
            let (placement, mut warnings) = plan_placement(&current.records, &candidate);
            for warning in &warnings {
                warn!("{}", warning.message);
            }

            match placement {
                Placement::Existing(i) => {
                    return Ok(Written {
                        data: current.records[i].clone(),
                        warnings,
                    });
                }
                Placement::BackfillBarcode(i) => {
                    let mut record = current.records[i].clone();
                    record.barcode = candidate.barcode.clone();
                    record
                        .meta
                        .source_map
                        .insert(Field::Barcode, Provenance::from(candidate.source()));
                    merge::touch(&mut record, Utc::now());
                    schema::check_record(&record)?;

                    let mut records = current.records.clone();
                    records[i] = record.clone();
                    self.commit(current.with_records(records))?;
                    info!("Backfilled barcode onto record {}", record.id);
                    return Ok(Written {
                        data: record,
                        warnings,
                    });
                }
                Placement::Create => {
                    // The set changed since the preview; prepare outside the gate.
                    let Some((mut record, prep_warnings)) = prepared.take() else {
                        continue;
                    };
                    record.id = identity::unique_id(&current.records, record.id);
                    schema::check_record(&record)?;

                    let mut records = current.records.clone();
                    records.push(record.clone());
                    self.commit(current.with_records(records))?;
                    info!("Created record {}", record.id);
                    warnings.extend(prep_warnings);
                    return Ok(Written {
                        data: record,
                        warnings,
                    });
                }
            }
        }
    }

    pub fn get_by_barcode(&self, barcode: &str) -> Result<SupplementRecord, StoreError> {
        self.find_by_barcode(barcode)
            .ok_or_else(|| StoreError::NotFound(format!("no record with barcode {}", barcode.trim())))
    }

    pub fn get_by_id(&self, id: &str) -> Result<SupplementRecord, StoreError> {
        self.snapshot()
            .records
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("no record with id {id}")))
    }

    /// Every record, as of one consistent snapshot.
    pub fn all(&self) -> Vec<SupplementRecord> {
        self.snapshot().records.clone()
    }

    /// Applies a user correction to the record holding `barcode`.
    pub fn update(
        &self,
        barcode: &str,
        updates: CandidateRecord,
    ) -> Result<Written<SupplementRecord>, StoreError> {
        let mut warnings = Vec::new();
        let now = Utc::now();

        let preview = self.get_by_barcode(barcode)?;
        let detected = if merge::needs_category_detection(&updates) {
            let name = updates.product_name.as_deref().unwrap_or(&preview.product_name);
            let ingredients = updates.ingredients.as_deref().unwrap_or_default();
            match self.collaborators.classifier.classify(name, ingredients) {
                Ok(classification) => Some(classification),
                Err(e) => {
                    warn!("Category detection skipped for {barcode}: {e}");
                    warnings.push(Warning::from(e));
                    None
                }
            }
        } else {
            None
        };
        let threshold = self.config.auto_detect_threshold;
        let quality = if updates.quality.is_none() {
            let corrected = merge::apply_correction(&preview, &updates, detected.as_ref(), threshold, now);
            self.analyze_quality(&corrected.record, &mut warnings)
        } else {
            None
        };

        let _gate = self.write_gate.lock();
        let current = self.snapshot();
        let i = identity::position_by_barcode(&current.records, barcode)
            .ok_or_else(|| StoreError::NotFound(format!("no record with barcode {}", barcode.trim())))?;

        let Merged { mut record, .. } =
            merge::apply_correction(&current.records[i], &updates, detected.as_ref(), threshold, now);
        if let Some(report) = quality {
            record.quality = Some(report);
            record.meta.source_map.insert(Field::Quality, Provenance::AutoDetected);
        }
        ensure_unique_barcode(&current.records, i, &record)?;
        schema::check_record(&record)?;

        let mut records = current.records.clone();
        records[i] = record.clone();
        self.commit(current.with_records(records))?;
        info!("Applied user correction to record {}", record.id);
        Ok(Written {
            data: record,
            warnings,
        })
    }

    /// Folds a provider candidate into the record it resolves to. Only gaps
    /// are filled; nothing is written when no field changed.
    pub fn merge_from_source(
        &self,
        barcode: Option<&str>,
        mut candidate: CandidateRecord,
    ) -> Result<Written<SupplementRecord>, StoreError> {
        reject_combined_source(&candidate)?;
        candidate.barcode =
            clean_barcode(barcode).or_else(|| clean_barcode(candidate.barcode.as_deref()));
        let source = candidate.source();

        let _gate = self.write_gate.lock();
        let current = self.snapshot();
        let mut warnings = Vec::new();
        let i = match identity::resolve(&current.records, &candidate) {
            Resolution::Barcode(i) => i,
            Resolution::Key(i) => i,
            Resolution::Ambiguous { first, others } => {
                let warning = ambiguous_warning(&current.records, first, &others);
                warn!("{}", warning.message);
                warnings.push(warning);
                first
            }
            Resolution::NotFound => {
                return Err(StoreError::NotFound("candidate matches no stored record".to_string()));
            }
        };
        if barcode_conflicts(&current.records[i], &candidate) {
            return Err(StoreError::NotFound(format!(
                "record {} carries a different barcode",
                current.records[i].id
            )));
        }

        let merged = merge::merge_sources(&current.records[i], &candidate, source, Utc::now());
        if !merged.is_changed() {
            debug!("Merge from {source} changed nothing on {}", merged.record.id);
            return Ok(Written {
                data: merged.record,
                warnings,
            });
        }
        ensure_unique_barcode(&current.records, i, &merged.record)?;
        schema::check_record(&merged.record)?;

        let mut records = current.records.clone();
        records[i] = merged.record.clone();
        self.commit(current.with_records(records))?;
        info!(
            "Merged {} field(s) from {source} into {}",
            merged.changed.len(),
            merged.record.id
        );
        Ok(Written {
            data: merged.record,
            warnings,
        })
    }

    /// Removes the record holding `barcode` and returns it.
    pub fn delete(&self, barcode: &str) -> Result<Written<SupplementRecord>, StoreError> {
        let _gate = self.write_gate.lock();
        let current = self.snapshot();
        let i = identity::position_by_barcode(&current.records, barcode)
            .ok_or_else(|| StoreError::NotFound(format!("no record with barcode {}", barcode.trim())))?;

        let mut records = current.records.clone();
        let removed = records.remove(i);
        self.commit(current.with_records(records))?;
        info!("Deleted record {}", removed.id);
        Ok(Written::clean(removed))
    }

    pub fn search(&self, query: &SearchQuery) -> SearchPage {
        let current = self.snapshot();
        let needle = query
            .text
            .as_deref()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty());
        let brand = query.brand.as_deref().map(|b| b.trim().to_lowercase());

        let matches: Vec<&SupplementRecord> = current
            .records
            .iter()
            .filter(|r| needle.as_deref().map_or(true, |n| matches_text(r, n)))
            .filter(|r| query.category.map_or(true, |c| r.category == c))
            .filter(|r| brand.as_deref().map_or(true, |b| r.brand.to_lowercase() == b))
            .filter(|r| query.verified.map_or(true, |v| r.meta.verified == v))
            .collect();

        let limit = query
            .limit
            .unwrap_or(self.config.default_page_size)
            .min(self.config.max_page_size);
        SearchPage {
            total: matches.len(),
            items: matches
                .into_iter()
                .skip(query.offset)
                .take(limit)
                .cloned()
                .collect(),
            offset: query.offset,
            limit,
        }
    }

    pub fn stats(&self) -> StoreStats {
        let current = self.snapshot();
        let mut stats = StoreStats {
            total: current.records.len(),
            verified: 0,
            with_barcode: 0,
            by_category: BTreeMap::new(),
            by_source: BTreeMap::new(),
            last_updated: None,
            unmigrated: current.unmigrated.len(),
        };
        for record in &current.records {
            if record.meta.verified {
                stats.verified += 1;
            }
            if record.barcode.is_some() {
                stats.with_barcode += 1;
            }
            *stats.by_category.entry(record.category).or_default() += 1;
            *stats.by_source.entry(record.meta.source).or_default() += 1;
            stats.last_updated = stats.last_updated.max(Some(record.meta.last_updated));
        }
        stats
    }

    /// Re-runs migration over the stored set. A backup is always taken; the
    /// container is only rewritten when at least one record was migrated.
    pub fn migrate(&self) -> Result<MigrationResult, StoreError> {
        loop {
            let base = self.snapshot();
            let raw = raw_values(&base).map_err(StoreError::Persistence)?;
            let outcome =
                migration::migrate_batch(raw, self.collaborators.classifier.as_ref(), Utc::now());

            let _gate = self.write_gate.lock();
            if !Arc::ptr_eq(&base, &self.snapshot()) {
                debug!("Store changed during migration, retrying");
                continue;
            }

            let backup = self.storage.snapshot().map_err(|e| {
                error!("Backup before migration failed: {e}");
                StoreError::Persistence(e)
            })?;
            if outcome.migrated_count > 0 {
                let next = StoreState {
                    records: outcome.records,
                    unmigrated: outcome.unmigrated,
                };
                self.save(next)?;
            }
            self.prune_backups();
            info!(
                "Migration run: {} migrated, {} failed, backup at {}",
                outcome.migrated_count,
                outcome.errors.len(),
                backup.location
            );
            return Ok(MigrationResult {
                migrated_count: outcome.migrated_count,
                errors: outcome.errors,
                backup_path: backup.location,
            });
        }
    }

    /// Retained backup snapshots, oldest first.
    pub fn backups(&self) -> Result<Vec<BackupHandle>, StoreError> {
        Ok(self.storage.backups()?)
    }

    /// Waits for in-flight writes, then syncs and releases the storage medium.
    pub fn close(self) -> Result<(), StoreError> {
        let _gate = self.write_gate.lock();
        self.storage.close()?;
        info!("Store closed");
        Ok(())
    }

    fn snapshot(&self) -> Arc<StoreState> {
        self.state.read().clone()
    }

    fn find_by_barcode(&self, barcode: &str) -> Option<SupplementRecord> {
        let current = self.snapshot();
        identity::position_by_barcode(&current.records, barcode).map(|i| current.records[i].clone())
    }

    /// Backs up the persisted container, then writes `next` and swaps it in.
    /// Callers must hold the write gate.
    fn commit(&self, next: StoreState) -> Result<(), StoreError> {
        let backup = self.storage.snapshot().map_err(|e| {
            error!("Backup failed, write aborted: {e}");
            StoreError::Persistence(e)
        })?;
        debug!("Backup {} taken", backup.id);
        self.save(next)?;
        self.prune_backups();
        Ok(())
    }

    fn save(&self, next: StoreState) -> Result<(), StoreError> {
        let bytes = encode(&next)?;
        if let Err(e) = self.storage.save(&bytes) {
            error!("Write failed, in-memory state left unchanged: {e}");
            return Err(StoreError::Persistence(e));
        }
        *self.state.write() = Arc::new(next);
        Ok(())
    }

    fn prune_backups(&self) {
        match self.storage.prune(self.config.backup_retention) {
            Ok(0) => {}
            Ok(n) => debug!("Pruned {n} old backup(s)"),
            Err(e) => warn!("Backup pruning failed: {e}"),
        }
    }

    /// Builds a brand new record from `candidate`, consulting the classifier
    /// when no category was given and the quality analyzer when no quality
    /// report was given.
    fn prepare_new(&self, candidate: &CandidateRecord) -> (SupplementRecord, Vec<Warning>) {
        let mut warnings = Vec::new();
        let mut record = SupplementRecord::from_candidate(
            candidate,
            identity::normalized_key(candidate),
            SCHEMA_VERSION,
            Utc::now(),
        );
        merge::refresh_price_per_serving(&mut record);

        if candidate.category.is_none() {
            match self
                .collaborators
                .classifier
                .classify(&record.product_name, &record.ingredients)
            {
                Ok(c) if c.confidence > self.config.auto_detect_threshold => {
                    adopt_classification(&mut record, c);
                }
                Ok(c) => debug!(
                    "Classification {} at {:.2} not adopted for new record",
                    c.category, c.confidence
                ),
                Err(e) => {
                    warn!("Category detection skipped for new record: {e}");
                    warnings.push(Warning::from(e));
                }
            }
        }
        if candidate.quality.is_none() {
            if let Some(report) = self.analyze_quality(&record, &mut warnings) {
                record.quality = Some(report);
                record.meta.source_map.insert(Field::Quality, Provenance::AutoDetected);
            }
        }
        (record, warnings)
    }

    fn analyze_quality(
        &self,
        record: &SupplementRecord,
        warnings: &mut Vec<Warning>,
    ) -> Option<QualityReport> {
        let analyzer = self.collaborators.quality.as_ref()?;
        match analyzer.analyze(record) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Quality analysis skipped for {}: {e}", record.id);
                warnings.push(Warning::from(e));
                None
            }
        }
    }
}

fn adopt_classification(record: &mut SupplementRecord, classification: Classification) {
    record.category = classification.category;
    record.sub_category = classification.sub_category.filter(|s| schema::is_slug(s));
    for field in [Field::Category, Field::SubCategory] {
        record.meta.source_map.insert(field, Provenance::AutoDetected);
    }
}

fn plan_placement(records: &[SupplementRecord], candidate: &CandidateRecord) -> (Placement, Vec<Warning>) {
    let mut warnings = Vec::new();
    let i = match identity::resolve(records, candidate) {
        Resolution::Barcode(i) => return (Placement::Existing(i), warnings),
        Resolution::NotFound => return (Placement::Create, warnings),
        Resolution::Key(i) => i,
        Resolution::Ambiguous { first, others } => {
            warnings.push(ambiguous_warning(records, first, &others));
            first
        }
    };

    let existing = &records[i];
    if barcode_conflicts(existing, candidate) {
        warnings.push(Warning::new(
            WarningKind::BarcodeConflict,
            format!(
                "record {} matches by key but carries a different barcode; created a new record",
                existing.id
            ),
        ));
        return (Placement::Create, warnings);
    }
    if existing.barcode.is_none() && candidate.barcode.is_some() {
        (Placement::BackfillBarcode(i), warnings)
    } else {
        (Placement::Existing(i), warnings)
    }
}

fn ambiguous_warning(records: &[SupplementRecord], first: usize, others: &[usize]) -> Warning {
    let ids: Vec<&str> = others.iter().map(|&i| records[i].id.as_str()).collect();
    Warning::new(
        WarningKind::MergeAmbiguous,
        format!(
            "candidate key matches {} records; used {} over {}",
            others.len() + 1,
            records[first].id,
            ids.join(", ")
        ),
    )
}

/// A key match that already holds another barcode is a different product.
fn barcode_conflicts(existing: &SupplementRecord, candidate: &CandidateRecord) -> bool {
    match (existing.barcode.as_deref(), candidate.barcode.as_deref()) {
        (Some(held), Some(wanted)) => held.trim() != wanted.trim(),
        _ => false,
    }
}

fn ensure_unique_barcode(
    records: &[SupplementRecord],
    index: usize,
    record: &SupplementRecord,
) -> Result<(), ValidationError> {
    let Some(code) = record.barcode.as_deref() else {
        return Ok(());
    };
    match identity::position_by_barcode(records, code) {
        Some(other) if other != index => Err(ValidationError::single(
            "barcode",
            format!("{} is already assigned to record {}", code.trim(), records[other].id),
        )),
        _ => Ok(()),
    }
}

fn reject_combined_source(candidate: &CandidateRecord) -> Result<(), ValidationError> {
    if candidate.source == Some(Source::Combined) {
        return Err(ValidationError::single(
            "source",
            "'combined' is not a valid provider source",
        ));
    }
    Ok(())
}

fn clean_barcode(barcode: Option<&str>) -> Option<String> {
    barcode
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(str::to_string)
}

fn matches_text(record: &SupplementRecord, needle: &str) -> bool {
    record.product_name.to_lowercase().contains(needle)
        || record.brand.to_lowercase().contains(needle)
        || record
            .ingredients
            .iter()
            .any(|i| i.name.to_lowercase().contains(needle))
}

fn decode_container(bytes: &[u8]) -> Result<Vec<Value>, StoreError> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(other) => Err(StoreError::Initialization(format!(
            "container must hold a JSON array, found {}",
            match other {
                Value::Object(_) => "an object",
                _ => "a scalar",
            }
        ))),
        Err(e) => Err(StoreError::Initialization(format!("container is corrupt: {e}"))),
    }
}

fn raw_values(state: &StoreState) -> Result<Vec<Value>, StorageError> {
    let mut values = Vec::with_capacity(state.records.len() + state.unmigrated.len());
    for record in &state.records {
        values.push(serde_json::to_value(record)?);
    }
    values.extend(state.unmigrated.iter().cloned());
    Ok(values)
}

/// Typed records first, then unmigrated values exactly as they were read.
fn encode(state: &StoreState) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec_pretty(&raw_values(state)?)?)
}

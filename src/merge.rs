//! Source-precedence merging and user corrections.
//!
//! Two write paths exist:
//!
//! - [`merge_sources`] folds a provider candidate into an existing record.
//!   It only fills gaps: a field is written when the stored value is null,
//!   empty or a default sentinel, and never when the user last set it.
//! - [`apply_correction`] is the user path. Every supplied field is
//!   force-written, attributed to the user, and the record becomes verified.
//!
//! Both return a [`Merged`] that lists the fields actually touched so callers
//! can skip a write when nothing changed.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};

use crate::collaborators::Classification;
use crate::schema;
use crate::supplement_model::{
    CandidateRecord, Field, Provenance, Source, SupplementRecord,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Merged {
    pub record: SupplementRecord,
    pub changed: Vec<Field>,
}

impl Merged {
    pub fn is_changed(&self) -> bool {
        !self.changed.is_empty()
    }

    fn unchanged(record: SupplementRecord) -> Self {
        Merged {
            record,
            changed: Vec::new(),
        }
    }
}

/// Gap-filling merge of `incoming` into `base` on behalf of `source`.
pub fn merge_sources(
    base: &SupplementRecord,
    incoming: &CandidateRecord,
    source: Source,
    now: DateTime<Utc>,
) -> Merged {
    let mut record = base.clone();
    let mut changed = Vec::new();
    let writable = |field: Field| base.provenance(field) != Some(Provenance::User);

    for field in Field::ALL.iter().copied() {
        if !writable(field) {
            continue;
        }
        let touched = match field {
            Field::Ingredients => merge_ingredients(&mut record, incoming),
            Field::ServingSize => merge_serving_size(&mut record, incoming),
            Field::Price => merge_price(&mut record, incoming),
            _ if record.is_unset(field) => write_field(&mut record, incoming, field),
            _ => false,
        };
        if touched {
            record.meta.source_map.insert(field, Provenance::from(source));
            changed.push(field);
        }
    }

    if changed.is_empty() {
        return Merged::unchanged(record);
    }

    record.meta.source = combined_source(&record, source);
    if changed.contains(&Field::Price) || changed.contains(&Field::ServingsPerContainer) {
        refresh_price_per_serving(&mut record);
    }
    touch(&mut record, now);
    Merged { record, changed }
}

/// Whether a correction needs the category classifier: new ingredients were
/// supplied but no explicit category.
pub fn needs_category_detection(updates: &CandidateRecord) -> bool {
    updates.ingredients.is_some() && updates.category.is_none()
}

/// Force-writes a user correction. `detected` is the classifier's verdict on
/// the new ingredient list, adopted only above `threshold`.
pub fn apply_correction(
    existing: &SupplementRecord,
    updates: &CandidateRecord,
    detected: Option<&Classification>,
    threshold: f64,
    now: DateTime<Utc>,
) -> Merged {
    let mut record = existing.clone();
    let mut changed = Vec::new();

    // A supplied field becomes user-owned even when it confirms the stored value.
    for field in Field::ALL.iter().copied().filter(|&f| updates.supplies(f)) {
        if write_field(&mut record, updates, field) {
            changed.push(field);
        }
        record.meta.source_map.insert(field, Provenance::User);
    }

    if needs_category_detection(updates) {
        if let Some(detected) = detected.filter(|d| d.confidence > threshold) {
            record.category = detected.category;
            record.sub_category = detected.sub_category.clone().filter(|s| schema::is_slug(s));
            for field in [Field::Category, Field::SubCategory] {
                record.meta.source_map.insert(field, Provenance::AutoDetected);
                changed.push(field);
            }
        }
    }

    record.meta.verified = true;
    record.meta.source = combined_source(&record, Source::User);
    if changed.contains(&Field::Price) || changed.contains(&Field::ServingsPerContainer) {
        refresh_price_per_serving(&mut record);
    }
    touch(&mut record, now);
    Merged { record, changed }
}

/// Recomputes `price.pricePerServing` as `value / servingsPerContainer`,
/// rounded to two decimals, when both operands are known.
pub fn refresh_price_per_serving(record: &mut SupplementRecord) {
    if let (Some(value), Some(servings)) = (record.price.value, record.servings_per_container) {
        if servings > 0.0 {
            record.price.price_per_serving = Some((value / servings * 100.0).round() / 100.0);
        }
    }
}

/// Advances `meta.lastUpdated`, strictly past its previous value even when
/// the clock has not moved.
pub fn touch(record: &mut SupplementRecord, now: DateTime<Utc>) {
    let floor = record.meta.last_updated + Duration::microseconds(1);
    record.meta.last_updated = if now >= floor { now } else { floor };
}

/// `meta.source` after `latest` contributed: the single contributor, or
/// `combined` once more than one distinct source has set a field.
fn combined_source(record: &SupplementRecord, latest: Source) -> Source {
    let mut contributors: BTreeSet<Source> = record
        .meta
        .source_map
        .values()
        .filter_map(|p| p.contributor())
        .collect();
    contributors.insert(latest);
    if record.meta.source != Source::Combined {
        contributors.insert(record.meta.source);
    }
    if contributors.len() > 1 || record.meta.source == Source::Combined {
        Source::Combined
    } else {
        latest
    }
}

/// Copies `field` from `from` into `record` when `from` supplies it.
/// Returns whether the stored value changed.
fn write_field(record: &mut SupplementRecord, from: &CandidateRecord, field: Field) -> bool {
    fn set<T: PartialEq>(slot: &mut T, value: T) -> bool {
        if *slot == value {
            false
        } else {
            *slot = value;
            true
        }
    }

    match field {
        Field::Barcode => match &from.barcode {
            Some(b) => set(&mut record.barcode, Some(b.trim().to_string())),
            None => false,
        },
        Field::ProductName => match &from.product_name {
            Some(n) if !n.trim().is_empty() => set(&mut record.product_name, n.trim().to_string()),
            _ => false,
        },
        Field::Brand => match &from.brand {
            Some(b) if !b.trim().is_empty() => set(&mut record.brand, b.trim().to_string()),
            _ => false,
        },
        Field::Category => match from.category {
            Some(c) => set(&mut record.category, c),
            None => false,
        },
        Field::SubCategory => match &from.sub_category {
            Some(s) => set(&mut record.sub_category, Some(s.clone())),
            None => false,
        },
        Field::Form => match from.form {
            Some(f) => set(&mut record.form, f),
            None => false,
        },
        Field::ServingsPerContainer => match from.servings_per_container {
            Some(s) => set(&mut record.servings_per_container, Some(s)),
            None => false,
        },
        Field::ServingSize => match &from.serving_size {
            Some(size) => {
                let mut next = record.serving_size.clone();
                if size.amount.is_some() {
                    next.amount = size.amount;
                }
                if size.unit.is_some() {
                    next.unit = size.unit;
                }
                set(&mut record.serving_size, next)
            }
            None => false,
        },
        Field::Ingredients => match &from.ingredients {
            Some(list) => set(&mut record.ingredients, list.clone()),
            None => false,
        },
        Field::Price => match &from.price {
            Some(price) => {
                let mut next = record.price.clone();
                if price.value.is_some() {
                    next.value = price.value;
                }
                if price.currency.is_some() {
                    next.currency = price.currency.clone();
                }
                if price.price_per_serving.is_some() {
                    next.price_per_serving = price.price_per_serving;
                }
                set(&mut record.price, next)
            }
            None => false,
        },
        Field::Quality => match &from.quality {
            Some(q) => set(&mut record.quality, Some(q.clone())),
            None => false,
        },
    }
}

/// Name-matched ingredient merge: existing entries gain a dosage/unit they
/// lack, unmatched incoming entries are appended.
fn merge_ingredients(record: &mut SupplementRecord, incoming: &CandidateRecord) -> bool {
    let Some(list) = &incoming.ingredients else {
        return false;
    };
    let mut touched = false;
    for item in list {
        match record.ingredients.iter_mut().find(|i| i.same_name(&item.name)) {
            Some(existing) => {
                if existing.dosage.is_none() && item.dosage.is_some() {
                    existing.dosage = item.dosage;
                    touched = true;
                }
                if existing.unit.is_none() && item.unit.is_some() {
                    existing.unit = item.unit;
                    touched = true;
                }
            }
            None => {
                record.ingredients.push(item.clone());
                touched = true;
            }
        }
    }
    touched
}

fn merge_serving_size(record: &mut SupplementRecord, incoming: &CandidateRecord) -> bool {
    let Some(size) = &incoming.serving_size else {
        return false;
    };
    let mut touched = false;
    if record.serving_size.amount.is_none() && size.amount.is_some() {
        record.serving_size.amount = size.amount;
        touched = true;
    }
    if record.serving_size.unit.is_none() && size.unit.is_some() {
        record.serving_size.unit = size.unit;
        touched = true;
    }
    touched
}

fn merge_price(record: &mut SupplementRecord, incoming: &CandidateRecord) -> bool {
    let Some(price) = &incoming.price else {
        return false;
    };
    let mut touched = false;
    if record.price.value.is_none() && price.value.is_some() {
        record.price.value = price.value;
        touched = true;
    }
    if record.price.currency.is_none() && price.currency.is_some() {
        record.price.currency = price.currency.clone();
        touched = true;
    }
    if record.price.price_per_serving.is_none() && price.price_per_serving.is_some() {
        record.price.price_per_serving = price.price_per_serving;
        touched = true;
    }
    touched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::normalized_key;
    use crate::schema::SCHEMA_VERSION;
    use crate::supplement_model::{Category, Form, Ingredient, Price, Unit};

    fn record(candidate: CandidateRecord) -> SupplementRecord {
        let now = Utc::now();
        SupplementRecord::from_candidate(&candidate, normalized_key(&candidate), SCHEMA_VERSION, now)
    }

    fn base() -> SupplementRecord {
        record(CandidateRecord {
            product_name: Some("Omega 3 Fish Oil".into()),
            ingredients: Some(vec![
                Ingredient::new("EPA", None, None),
                Ingredient::new("DHA", Some(200.0), Some(Unit::Mg)),
            ]),
            source: Some(Source::Ai),
            ..Default::default()
        })
    }

    #[test]
    fn merge_fills_only_gaps() {
        let base = base();
        let incoming = CandidateRecord {
            product_name: Some("Fish Oil Deluxe".into()),
            brand: Some("Nordic".into()),
            form: Some(Form::Capsule),
            ..Default::default()
        };
        let merged = merge_sources(&base, &incoming, Source::ExternalCatalog, Utc::now());

        assert_eq!(merged.record.product_name, "Omega 3 Fish Oil");
        assert_eq!(merged.record.brand, "Nordic");
        assert_eq!(merged.record.form, Form::Capsule);
        assert_eq!(merged.changed, vec![Field::Brand, Field::Form]);
        assert_eq!(merged.record.provenance(Field::Brand), Some(Provenance::ExternalCatalog));
        assert_eq!(merged.record.provenance(Field::ProductName), Some(Provenance::Ai));
        assert_eq!(merged.record.meta.source, Source::Combined);
    }

    #[test]
    fn merge_never_overwrites_user_fields() {
        let mut base = base();
        base.brand = "Unknown Brand".into();
        base.meta.source_map.insert(Field::Brand, Provenance::User);
        base.meta
            .source_map
            .insert(Field::Ingredients, Provenance::User);

        let incoming = CandidateRecord {
            brand: Some("Catalog Brand".into()),
            ingredients: Some(vec![Ingredient::new("Vitamin E", Some(5.0), Some(Unit::Mg))]),
            ..Default::default()
        };
        let merged = merge_sources(&base, &incoming, Source::ExternalCatalog, Utc::now());

        assert!(!merged.is_changed());
        assert_eq!(merged.record, base);
    }

    #[test]
    fn ingredients_merge_by_name_case_insensitively() {
        let base = base();
        let incoming = CandidateRecord {
            ingredients: Some(vec![
                Ingredient::new("epa", Some(300.0), Some(Unit::Mg)),
                Ingredient::new("dha", Some(999.0), Some(Unit::Mcg)),
                Ingredient::new("Vitamin E", Some(5.0), Some(Unit::Mg)),
            ]),
            ..Default::default()
        };
        let merged = merge_sources(&base, &incoming, Source::ExternalCatalog, Utc::now());
        let ingredients = &merged.record.ingredients;

        assert_eq!(ingredients.len(), 3);
        assert_eq!(ingredients[0].dosage, Some(300.0));
        assert_eq!(ingredients[1].dosage, Some(200.0));
        assert_eq!(ingredients[1].unit, Some(Unit::Mg));
        assert_eq!(ingredients[2].name, "Vitamin E");
    }

    #[test]
    fn unchanged_merge_keeps_timestamp() {
        let base = base();
        let merged = merge_sources(&base, &CandidateRecord::default(), Source::Ai, Utc::now());
        assert_eq!(merged.record.meta.last_updated, base.meta.last_updated);
    }

    #[test]
    fn price_per_serving_is_derived_after_merge() {
        let base = base();
        let incoming = CandidateRecord {
            servings_per_container: Some(60.0),
            price: Some(Price {
                value: Some(300.0),
                currency: Some("SEK".into()),
                price_per_serving: None,
            }),
            ..Default::default()
        };
        let merged = merge_sources(&base, &incoming, Source::ExternalCatalog, Utc::now());
        assert_eq!(merged.record.price.price_per_serving, Some(5.0));
    }

    #[test]
    fn correction_force_writes_and_verifies() {
        let mut base = base();
        base.servings_per_container = Some(60.0);
        base.price.value = Some(300.0);
        refresh_price_per_serving(&mut base);

        let updates = CandidateRecord {
            product_name: Some("Omega-3 Ultra".into()),
            servings_per_container: Some(120.0),
            ..Default::default()
        };
        let merged = apply_correction(&base, &updates, None, 0.8, Utc::now());

        assert_eq!(merged.record.product_name, "Omega-3 Ultra");
        assert_eq!(merged.record.provenance(Field::ProductName), Some(Provenance::User));
        assert_eq!(merged.record.price.price_per_serving, Some(2.5));
        assert!(merged.record.meta.verified);
        assert!(merged.record.meta.last_updated > base.meta.last_updated);
    }

    #[test]
    fn confirming_a_value_claims_it_without_changing_it() {
        let base = base();
        let updates = CandidateRecord {
            product_name: Some("Omega 3 Fish Oil".into()),
            ..Default::default()
        };
        let merged = apply_correction(&base, &updates, None, 0.8, Utc::now());

        assert_eq!(merged.record.provenance(Field::ProductName), Some(Provenance::User));
        assert!(merged.changed.is_empty());
    }

    #[test]
    fn confident_detection_is_adopted_as_auto_detected() {
        let base = base();
        let updates = CandidateRecord {
            ingredients: Some(vec![Ingredient::new("Krill oil", Some(500.0), Some(Unit::Mg))]),
            ..Default::default()
        };
        let detected = Classification {
            category: Category::FattyAcid,
            sub_category: Some("omega-3".into()),
            confidence: 0.92,
        };
        let merged = apply_correction(&base, &updates, Some(&detected), 0.8, Utc::now());

        assert_eq!(merged.record.category, Category::FattyAcid);
        assert_eq!(merged.record.provenance(Field::Category), Some(Provenance::AutoDetected));
        assert_eq!(merged.record.provenance(Field::SubCategory), Some(Provenance::AutoDetected));
        assert_eq!(merged.record.provenance(Field::Ingredients), Some(Provenance::User));
    }

    #[test]
    fn weak_detection_preserves_category() {
        let mut base = base();
        base.category = Category::Herb;
        let updates = CandidateRecord {
            ingredients: Some(vec![Ingredient::new("Krill oil", None, None)]),
            ..Default::default()
        };
        let detected = Classification {
            category: Category::FattyAcid,
            sub_category: None,
            confidence: 0.5,
        };
        let merged = apply_correction(&base, &updates, Some(&detected), 0.8, Utc::now());

        assert_eq!(merged.record.category, Category::Herb);
        assert_eq!(merged.record.provenance(Field::Category), None);
        assert!(merged.record.meta.verified);
    }

    #[test]
    fn touch_is_strictly_monotonic() {
        let mut r = base();
        let stale = r.meta.last_updated - Duration::seconds(10);
        let before = r.meta.last_updated;
        touch(&mut r, stale);
        assert!(r.meta.last_updated > before);
    }
}

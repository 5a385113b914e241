//! Upgrades stored records to the current schema.
//!
//! Version 0 ("legacy") records are whatever earlier app builds wrote: flat
//! objects with free-text prices, serving sizes such as `"2 capsules"` and
//! ingredient lists that may be arrays or maps keyed by ingredient name.
//! [`migrate_legacy_to_v1`] turns one such value into a typed
//! [`SupplementRecord`]; [`migrate_batch`] applies it across a whole stored
//! container while isolating per-record failures.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::collaborators::{CategoryClassifier, KeywordClassifier};
use crate::error::{ErrorKind, MigrationError};
use crate::identity;
use crate::merge::refresh_price_per_serving;
use crate::schema::{self, SCHEMA_VERSION};
use crate::supplement_model::{
    Category, Field, Form, Ingredient, Meta, Price, Provenance, QualityReport, ServingSize,
    Source, SupplementRecord, Unit, UNKNOWN_BRAND, UNKNOWN_PRODUCT,
};

static AMOUNT_WITH_UNIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\d+(?:[.,]\d+)?)\s*(mcg|µg|ug|mg|kg|g|ml|iu|ie|cfu|softgels?|capsules?|caps|kapslar|kapsel|tablets?|tabs?|tabletter|scoops?|gummies|gummy|drops?)\b",
    )
    .expect("serving size pattern is valid")
});

/// Outcome of [`SupplementStore::migrate`](crate::supplement_store::SupplementStore::migrate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    pub migrated_count: usize,
    pub errors: Vec<MigrationError>,
    /// Location of the backup taken before any record was touched.
    pub backup_path: String,
}

/// In-memory result of migrating a whole container.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub records: Vec<SupplementRecord>,
    /// Values that could not be migrated, kept exactly as stored.
    pub unmigrated: Vec<Value>,
    pub migrated_count: usize,
    pub errors: Vec<MigrationError>,
}

/// Declared schema version, or 0 when absent or unrecognized.
pub fn detect_version(raw: &Value) -> u32 {
    raw.get("schemaVersion")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| (1..=SCHEMA_VERSION).contains(v))
        .unwrap_or(0)
}

/// Migrates every stored value. Already-current records are re-validated;
/// any value that fails either path is kept verbatim in `unmigrated`.
pub fn migrate_batch(
    raw_records: Vec<Value>,
    classifier: &dyn CategoryClassifier,
    now: DateTime<Utc>,
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    let mut barcodes: HashSet<String> = HashSet::new();

    for (index, raw) in raw_records.into_iter().enumerate() {
        let legacy = detect_version(&raw) == 0;
        let attempt = if legacy {
            migrate_legacy_to_v1(&raw, classifier, now)
        } else {
            revalidate(&raw)
        };

        let result = attempt.and_then(|record| match &record.barcode {
            Some(barcode) if !barcodes.insert(barcode.clone()) => {
                Err(failure(&raw, format!("duplicate barcode {barcode}")))
            }
            _ => Ok(record),
        });

        match result {
            Ok(mut record) => {
                if legacy {
                    record.id = identity::unique_id(&outcome.records, record.id);
                    debug!("Migrated legacy record #{index} to schema v{SCHEMA_VERSION}");
                    outcome.migrated_count += 1;
                }
                outcome.records.push(record);
            }
            Err(mut error) => {
                error.index = index;
                warn!("{error}; keeping original value");
                outcome.errors.push(error);
                outcome.unmigrated.push(raw);
            }
        }
    }
    outcome
}

fn revalidate(raw: &Value) -> Result<SupplementRecord, MigrationError> {
    let record: SupplementRecord = serde_json::from_value(raw.clone())
        .map_err(|e| failure(raw, format!("malformed v1 record: {e}")))?;
    schema::check_record(&record).map_err(|e| failure(raw, e.to_string()))?;
    Ok(record)
}

fn failure(raw: &Value, message: String) -> MigrationError {
    MigrationError {
        kind: ErrorKind::MigrationError,
        index: 0,
        id: raw.get("id").and_then(Value::as_str).map(str::to_string),
        message,
    }
}

/// Deterministically upgrades one legacy value. Unparseable numbers become
/// null rather than failing the record. The returned error carries index 0;
/// batch callers overwrite it with the record's position.
pub fn migrate_legacy_to_v1(
    raw: &Value,
    classifier: &dyn CategoryClassifier,
    now: DateTime<Utc>,
) -> Result<SupplementRecord, MigrationError> {
    let object = raw
        .as_object()
        .ok_or_else(|| failure(raw, format!("expected an object, found {}", json_type(raw))))?;

    let product_name = first_text(object, &["productName", "name", "title"])
        .unwrap_or_else(|| UNKNOWN_PRODUCT.to_string());
    let brand = first_text(object, &["brand", "manufacturer"])
        .unwrap_or_else(|| UNKNOWN_BRAND.to_string());
    let ingredients = object
        .get("ingredients")
        .map(legacy_ingredients)
        .unwrap_or_default();

    let (category, sub_category) = match object
        .get("category")
        .and_then(Value::as_str)
        .and_then(|c| c.parse::<Category>().ok())
    {
        Some(category) => (
            category,
            text(object, "subCategory").filter(|s| schema::is_slug(s)),
        ),
        None => infer_category(classifier, &product_name, &ingredients),
    };

    let form = object
        .get("form")
        .and_then(Value::as_str)
        .and_then(form_from_keywords)
        .or_else(|| form_from_keywords(&product_name))
        .unwrap_or_default();

    let servings_per_container = first_number(object, &["servingsPerContainer", "servings"])
        .filter(|s| *s > 0.0);

    let mut price = match object.get("price") {
        Some(Value::Object(p)) => Price {
            value: p.get("value").and_then(coerce_number),
            currency: p.get("currency").and_then(Value::as_str).map(str::to_uppercase),
            price_per_serving: None,
        },
        Some(v) => Price {
            value: coerce_number(v),
            ..Price::default()
        },
        None => Price::default(),
    };
    if price.currency.is_none() {
        price.currency = text(object, "currency").map(|c| c.to_uppercase());
    }

    let serving_size = match object.get("servingSize") {
        Some(Value::String(s)) => parse_serving_size(s),
        Some(Value::Object(s)) => ServingSize {
            amount: s.get("amount").and_then(coerce_number),
            unit: s.get("unit").and_then(Value::as_str).and_then(unit_from_token),
        },
        Some(v) => ServingSize {
            amount: coerce_number(v),
            unit: None,
        },
        None => ServingSize::default(),
    };

    let source = object
        .get("source")
        .and_then(Value::as_str)
        .and_then(legacy_source)
        .unwrap_or(Source::Ai);

    let last_updated = first_text(object, &["lastUpdated", "updatedAt"])
        .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(now);

    let quality = object
        .get("quality")
        .filter(|q| !q.is_null())
        .and_then(|q| serde_json::from_value::<QualityReport>(q.clone()).ok());

    let mut record = SupplementRecord {
        schema_version: SCHEMA_VERSION,
        id: String::new(),
        barcode: first_text(object, &["barcode", "ean", "gtin"]),
        product_name,
        brand,
        category,
        sub_category,
        form,
        servings_per_container,
        serving_size,
        ingredients,
        price,
        quality,
        meta: Meta {
            source,
            verified: object.get("verified").and_then(Value::as_bool).unwrap_or(false),
            last_updated,
            source_map: BTreeMap::new(),
        },
    };
    record.id = text(object, "id").unwrap_or_else(|| identity::normalized_key(&record));
    refresh_price_per_serving(&mut record);

    let provenance = Provenance::from(source);
    for field in Field::ALL.iter().copied() {
        if !record.is_unset(field) {
            record.meta.source_map.insert(field, provenance);
        }
    }

    schema::check_record(&record).map_err(|e| failure(raw, e.to_string()))?;
    Ok(record)
}

fn infer_category(
    classifier: &dyn CategoryClassifier,
    name: &str,
    ingredients: &[Ingredient],
) -> (Category, Option<String>) {
    let verdict = classifier.classify(name, ingredients).or_else(|err| {
        warn!("{err}; falling back to keyword classification");
        KeywordClassifier.classify(name, ingredients)
    });
    match verdict {
        Ok(c) => (c.category, c.sub_category.filter(|s| schema::is_slug(s))),
        Err(_) => (Category::default(), None),
    }
}

/// Strips everything but digits and separators, then parses. A lone comma is
/// read as a decimal separator ("12,50").
pub fn coerce_number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let kept: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
                .collect();
            let normalized = if kept.contains('.') {
                kept.replace(',', "")
            } else {
                kept.replace(',', ".")
            };
            normalized.parse::<f64>().ok()
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite() && *v >= 0.0)
}

/// Parses free text like `"2 capsules"` or `"5 g"` into a serving size.
pub fn parse_serving_size(text: &str) -> ServingSize {
    if let Some(caps) = AMOUNT_WITH_UNIT.captures(text) {
        return ServingSize {
            amount: caps[1].replace(',', ".").parse().ok(),
            unit: unit_from_token(&caps[2]),
        };
    }
    ServingSize {
        amount: coerce_number(&Value::String(text.to_string())),
        unit: None,
    }
}

pub fn unit_from_token(token: &str) -> Option<Unit> {
    let unit = match token.trim().to_lowercase().as_str() {
        "mg" => Unit::Mg,
        "mcg" | "µg" | "ug" => Unit::Mcg,
        "g" => Unit::G,
        "ml" => Unit::Ml,
        "iu" | "ie" => Unit::Iu,
        "cfu" => Unit::Cfu,
        "capsule" | "capsules" | "caps" | "kapsel" | "kapslar" => Unit::Capsule,
        "tablet" | "tablets" | "tab" | "tabs" | "tabletter" => Unit::Tablet,
        "softgel" | "softgels" => Unit::Softgel,
        "scoop" | "scoops" => Unit::Scoop,
        "gummy" | "gummies" => Unit::Gummy,
        "drop" | "drops" => Unit::Drop,
        other => return other.parse().ok(),
    };
    Some(unit)
}

pub fn form_from_keywords(text: &str) -> Option<Form> {
    const FORMS: &[(&str, Form)] = &[
        ("softgel", Form::Capsule),
        ("capsule", Form::Capsule),
        ("kapsl", Form::Capsule),
        ("caps", Form::Capsule),
        ("tablet", Form::Tablet),
        ("tabs", Form::Tablet),
        ("powder", Form::Powder),
        ("pulver", Form::Powder),
        ("liquid", Form::Liquid),
        ("drops", Form::Liquid),
        ("syrup", Form::Liquid),
        ("gumm", Form::Gummy),
    ];
    let lower = text.to_lowercase();
    FORMS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, form)| *form)
}

fn legacy_source(tag: &str) -> Option<Source> {
    match tag.trim().to_lowercase().as_str() {
        "openfoodfacts" | "catalog" | "external" => Some(Source::ExternalCatalog),
        "manual" => Some(Source::User),
        other => other.parse().ok(),
    }
}

fn legacy_ingredients(value: &Value) -> Vec<Ingredient> {
    match value {
        Value::Array(items) => items.iter().filter_map(legacy_ingredient).collect(),
        Value::Object(map) => map
            .iter()
            .filter(|(name, _)| !name.trim().is_empty())
            .map(|(name, dose)| {
                let mut ingredient = Ingredient::new(name.trim(), None, None);
                match dose {
                    Value::Object(d) => {
                        ingredient.dosage = d.get("dosage").and_then(coerce_number);
                        ingredient.unit = d
                            .get("unit")
                            .and_then(Value::as_str)
                            .and_then(unit_from_token)
                            .or_else(|| dosage_unit(d.get("dosage")));
                    }
                    other => {
                        ingredient.dosage = coerce_number(other);
                        ingredient.unit = dosage_unit(Some(other));
                    }
                }
                ingredient
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn legacy_ingredient(item: &Value) -> Option<Ingredient> {
    match item {
        Value::String(s) => {
            let name = s.trim();
            if name.is_empty() {
                return None;
            }
            match AMOUNT_WITH_UNIT.captures(name) {
                Some(caps) => {
                    let at = caps.get(0).map_or(name.len(), |m| m.start());
                    let label = name[..at].trim().trim_end_matches(|c| c == '-' || c == ':').trim();
                    Some(Ingredient::new(
                        if label.is_empty() { name } else { label },
                        caps[1].replace(',', ".").parse().ok(),
                        unit_from_token(&caps[2]),
                    ))
                }
                None => Some(Ingredient::new(name, None, None)),
            }
        }
        Value::Object(o) => {
            let name = first_text(o, &["name", "ingredient"])?;
            Some(Ingredient {
                name,
                dosage: o.get("dosage").or_else(|| o.get("amount")).and_then(coerce_number),
                unit: o
                    .get("unit")
                    .and_then(Value::as_str)
                    .and_then(unit_from_token)
                    .or_else(|| dosage_unit(o.get("dosage"))),
                is_standardized: o.get("isStandardized").and_then(Value::as_bool).unwrap_or(false),
                standardized_to: text(o, "standardizedTo"),
            })
        }
        _ => None,
    }
}

/// Unit embedded in a dosage string such as `"400 mg"`.
fn dosage_unit(value: Option<&Value>) -> Option<Unit> {
    let text = value?.as_str()?;
    AMOUNT_WITH_UNIT
        .captures(text)
        .and_then(|caps| unit_from_token(&caps[2]))
}

fn text(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_text(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| text(object, k))
}

fn first_number(object: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| object.get(*k).and_then(coerce_number))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

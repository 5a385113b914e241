//! Record schema enforcement.
//!
//! Candidates arrive as loosely shaped JSON from extraction providers and
//! correction forms. [`parse_candidate`] walks that JSON field by field and
//! reports *every* violation at once instead of stopping at the first serde
//! error; [`check_record`] enforces the invariants of a finished
//! [`SupplementRecord`] before it is allowed anywhere near storage.

use std::str::FromStr;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::error::{FieldViolation, ValidationError};
use crate::identity;
use crate::merge;
use crate::supplement_model::{
    CandidateRecord, Ingredient, Price, QualityReport, ServingSize, Source, SupplementRecord,
};

/// Schema version written by this library. Records without a recognized
/// version tag are treated as version 0 (legacy).
pub const SCHEMA_VERSION: u32 = 1;

/// Accumulates violations while a value is being checked.
#[derive(Debug, Default)]
pub(crate) struct Violations(Vec<FieldViolation>);

impl Violations {
    pub(crate) fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldViolation::new(field, message));
    }

    pub(crate) fn finish<T>(self, value: T) -> Result<T, ValidationError> {
        if self.0.is_empty() {
            Ok(value)
        } else {
            Err(ValidationError { violations: self.0 })
        }
    }
}

/// Validates a raw candidate and turns it into a complete record with safe
/// defaults for every unset field.
pub fn validate(candidate: &Value) -> Result<SupplementRecord, ValidationError> {
    let candidate = parse_candidate(candidate)?;
    let id = identity::normalized_key(&candidate);
    let mut record = SupplementRecord::from_candidate(&candidate, id, SCHEMA_VERSION, Utc::now());
    merge::refresh_price_per_serving(&mut record);
    check_record(&record)?;
    Ok(record)
}

/// Structural and type checking of a raw candidate.
pub fn parse_candidate(value: &Value) -> Result<CandidateRecord, ValidationError> {
    let mut violations = Violations::default();
    let Some(object) = value.as_object() else {
        violations.push("$", "candidate must be a JSON object");
        return violations.finish(CandidateRecord::default());
    };

    let candidate = CandidateRecord {
        barcode: text(object, "barcode", &mut violations),
        product_name: text(object, "productName", &mut violations),
        brand: text(object, "brand", &mut violations),
        category: tag(object, "category", &mut violations),
        sub_category: text(object, "subCategory", &mut violations),
        form: tag(object, "form", &mut violations),
        servings_per_container: number(object, "servingsPerContainer", &mut violations),
        serving_size: serving_size(object, &mut violations),
        ingredients: ingredients(object, &mut violations),
        price: price(object, &mut violations),
        quality: quality(object, &mut violations),
        source: tag(object, "source", &mut violations),
    };

    if let Some(sub) = candidate.sub_category.as_deref() {
        if !is_slug(sub) {
            violations.push("subCategory", "must be a lowercase slug of letters, digits and dashes");
        }
    }
    if candidate.source == Some(Source::Combined) {
        violations.push("source", "'combined' is not a valid provider source");
    }
    if let Some(servings) = candidate.servings_per_container {
        if servings <= 0.0 {
            violations.push("servingsPerContainer", "must be greater than 0");
        }
    }

    violations.finish(candidate)
}

/// Invariants every stored record must satisfy.
pub fn check_record(record: &SupplementRecord) -> Result<(), ValidationError> {
    let mut violations = Violations::default();

    if record.schema_version != SCHEMA_VERSION {
        violations.push(
            "schemaVersion",
            format!("expected {SCHEMA_VERSION}, found {}", record.schema_version),
        );
    }
    if record.id.trim().is_empty() {
        violations.push("id", "must not be empty");
    }
    if let Some(barcode) = &record.barcode {
        if barcode.trim().is_empty() {
            violations.push("barcode", "must be null or non-empty");
        }
    }
    if record.product_name.trim().is_empty() {
        violations.push("productName", "must not be empty");
    }
    if record.brand.trim().is_empty() {
        violations.push("brand", "must not be empty");
    }
    if let Some(sub) = record.sub_category.as_deref() {
        if !is_slug(sub) {
            violations.push("subCategory", "must be a lowercase slug of letters, digits and dashes");
        }
    }
    if let Some(servings) = record.servings_per_container {
        if !servings.is_finite() || servings <= 0.0 {
            violations.push("servingsPerContainer", "must be a positive number");
        }
    }
    non_negative(record.serving_size.amount, "servingSize.amount", &mut violations);
    non_negative(record.price.value, "price.value", &mut violations);
    non_negative(record.price.price_per_serving, "price.pricePerServing", &mut violations);
    for (i, ingredient) in record.ingredients.iter().enumerate() {
        if ingredient.name.trim().is_empty() {
            violations.push(format!("ingredients[{i}].name"), "must not be empty");
        }
        non_negative(ingredient.dosage, &format!("ingredients[{i}].dosage"), &mut violations);
    }
    violations.finish(())
}

pub(crate) fn is_slug(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn non_negative(value: Option<f64>, field: &str, violations: &mut Violations) {
    if let Some(v) = value {
        if !v.is_finite() || v < 0.0 {
            violations.push(field, "must be a finite number >= 0");
        }
    }
}

fn present<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    object.get(key).filter(|v| !v.is_null())
}

fn text(object: &Map<String, Value>, key: &str, violations: &mut Violations) -> Option<String> {
    match present(object, key)? {
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.trim().to_string()),
        _ => {
            violations.push(key, "must be a string");
            None
        }
    }
}

fn tag<T: FromStr>(object: &Map<String, Value>, key: &str, violations: &mut Violations) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    tag_value(present(object, key)?, key, violations)
}

fn tag_value<T: FromStr>(value: &Value, field: &str, violations: &mut Violations) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    match value {
        Value::String(s) => match s.parse::<T>() {
            Ok(t) => Some(t),
            Err(e) => {
                violations.push(field, e.to_string());
                None
            }
        },
        Value::Null => None,
        _ => {
            violations.push(field, "must be a string tag");
            None
        }
    }
}

fn number(object: &Map<String, Value>, key: &str, violations: &mut Violations) -> Option<f64> {
    number_value(present(object, key)?, key, violations)
}

fn number_value(value: &Value, field: &str, violations: &mut Violations) -> Option<f64> {
    match value {
        Value::Null => None,
        Value::Number(n) => match n.as_f64() {
            Some(v) if v.is_finite() && v >= 0.0 => Some(v),
            _ => {
                violations.push(field, "must be a finite number >= 0");
                None
            }
        },
        _ => {
            violations.push(field, "must be a number");
            None
        }
    }
}

fn nested<'a>(
    object: &'a Map<String, Value>,
    key: &str,
    violations: &mut Violations,
) -> Option<&'a Map<String, Value>> {
    match present(object, key)? {
        Value::Object(inner) => Some(inner),
        _ => {
            violations.push(key, "must be an object");
            None
        }
    }
}

fn serving_size(object: &Map<String, Value>, violations: &mut Violations) -> Option<ServingSize> {
    let inner = nested(object, "servingSize", violations)?;
    Some(ServingSize {
        amount: inner
            .get("amount")
            .and_then(|v| number_value(v, "servingSize.amount", violations)),
        unit: inner
            .get("unit")
            .and_then(|v| tag_value(v, "servingSize.unit", violations)),
    })
}

fn price(object: &Map<String, Value>, violations: &mut Violations) -> Option<Price> {
    let inner = nested(object, "price", violations)?;
    let currency = match inner.get("currency") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => Some(s.trim().to_uppercase()),
        Some(_) => {
            violations.push("price.currency", "must be a string");
            None
        }
    };
    Some(Price {
        value: inner
            .get("value")
            .and_then(|v| number_value(v, "price.value", violations)),
        currency,
        price_per_serving: inner
            .get("pricePerServing")
            .and_then(|v| number_value(v, "price.pricePerServing", violations)),
    })
}

fn quality(object: &Map<String, Value>, violations: &mut Violations) -> Option<QualityReport> {
    let value = present(object, "quality")?;
    match serde_json::from_value::<QualityReport>(value.clone()) {
        Ok(report) => Some(report),
        Err(e) => {
            violations.push("quality", e.to_string());
            None
        }
    }
}

fn ingredients(object: &Map<String, Value>, violations: &mut Violations) -> Option<Vec<Ingredient>> {
    let items = match present(object, "ingredients")? {
        Value::Array(items) => items,
        _ => {
            violations.push("ingredients", "must be an array");
            return None;
        }
    };

    let mut parsed = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let field = |name: &str| format!("ingredients[{i}].{name}");
        let Some(entry) = item.as_object() else {
            violations.push(format!("ingredients[{i}]"), "must be an object");
            continue;
        };
        let name = match entry.get("name") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            _ => {
                violations.push(field("name"), "must be a non-empty string");
                continue;
            }
        };
        let is_standardized = match entry.get("isStandardized") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                violations.push(field("isStandardized"), "must be a boolean");
                false
            }
        };
        let standardized_to = match entry.get("standardizedTo") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                violations.push(field("standardizedTo"), "must be a string");
                None
            }
        };
        parsed.push(Ingredient {
            name,
            dosage: entry
                .get("dosage")
                .and_then(|v| number_value(v, &field("dosage"), violations)),
            unit: entry
                .get("unit")
                .and_then(|v| tag_value(v, &field("unit"), violations)),
            is_standardized,
            standardized_to,
        });
    }
    Some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supplement_model::{Category, Field, Form, Provenance, Unit, UNKNOWN_BRAND};
    use serde_json::json;

    #[test]
    fn validate_builds_record_with_defaults() {
        let record = validate(&json!({
            "productName": "Zinc Picolinate 25mg",
            "ingredients": [{"name": "Zinc", "dosage": 25, "unit": "mg"}],
            "form": "tablet",
            "source": "external-catalog"
        }))
        .unwrap();

        assert_eq!(record.schema_version, SCHEMA_VERSION);
        assert_eq!(record.brand, UNKNOWN_BRAND);
        assert_eq!(record.form, Form::Tablet);
        assert_eq!(record.category, Category::Supplement);
        assert_eq!(record.ingredients[0].unit, Some(Unit::Mg));
        assert_eq!(record.provenance(Field::Ingredients), Some(Provenance::ExternalCatalog));
    }

    #[test]
    fn validate_reports_every_violation() {
        let err = validate(&json!({
            "productName": 42,
            "form": "blob",
            "servingsPerContainer": -3,
            "price": {"value": "cheap", "currency": "SEK"},
            "ingredients": [{"name": "Iron", "dosage": -1}, {"dosage": 2}],
            "subCategory": "Not A Slug"
        }))
        .unwrap_err();

        let fields: Vec<&str> = err.fields().collect();
        for expected in [
            "productName",
            "form",
            "servingsPerContainer",
            "price.value",
            "ingredients[0].dosage",
            "ingredients[1].name",
            "subCategory",
        ] {
            assert!(fields.contains(&expected), "missing {expected} in {fields:?}");
        }
    }

    #[test]
    fn non_object_candidate_is_rejected() {
        let err = parse_candidate(&json!(["not", "a", "record"])).unwrap_err();
        assert_eq!(err.violations[0].field, "$");
    }

    #[test]
    fn combined_is_not_a_provider_source() {
        let err = parse_candidate(&json!({"source": "combined"})).unwrap_err();
        assert_eq!(err.fields().collect::<Vec<_>>(), vec!["source"]);
    }

    #[test]
    fn check_record_rejects_stale_schema_version() {
        let mut record = validate(&json!({"productName": "Iron"})).unwrap();
        record.schema_version = 0;
        let err = check_record(&record).unwrap_err();
        assert_eq!(err.violations[0].field, "schemaVersion");
    }
}

//! Data model definitions for supplement records.
//!
//! This module defines the canonical [`SupplementRecord`] stored by the
//! [`SupplementStore`](crate::supplement_store::SupplementStore), the partial
//! [`CandidateRecord`] shape delivered by extraction providers, and the small
//! closed vocabularies (category, form, unit, source, provenance) both use.
//!
//! Every vocabulary is a plain enum whose JSON form is a stable lowercase tag,
//! so a record written by one version of the library can be read back by the
//! next without any custom (de)serialization code.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel product name for records created without one.
pub const UNKNOWN_PRODUCT: &str = "Unknown Product";

/// Sentinel brand for records created without one.
pub const UNKNOWN_BRAND: &str = "Unknown Brand";

/// Returned when a string does not name any variant of a tag vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownTag {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! tag_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($(#[$vmeta:meta])* $variant:ident => $tag:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $tag)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $tag),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownTag;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let needle = s.trim();
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str().eq_ignore_ascii_case(needle))
                    .ok_or_else(|| UnknownTag {
                        kind: stringify!($name),
                        value: s.to_string(),
                    })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

tag_enum! {
    /// Top-level classification of a product.
    ///
    /// [`Category::Supplement`] is the generic tag and doubles as the
    /// "not yet classified" default that any later source may overwrite.
    Category {
        Vitamin => "vitamin",
        Mineral => "mineral",
        Herb => "herb",
        AminoAcid => "amino-acid",
        FattyAcid => "fatty-acid",
        Probiotic => "probiotic",
        Protein => "protein",
        Supplement => "supplement",
    }
}

impl Default for Category {
    fn default() -> Self {
        Category::Supplement
    }
}

tag_enum! {
    /// Physical form of the product. [`Form::Other`] is the unset default.
    Form {
        Capsule => "capsule",
        Tablet => "tablet",
        Powder => "powder",
        Liquid => "liquid",
        Gummy => "gummy",
        Other => "other",
    }
}

impl Default for Form {
    fn default() -> Self {
        Form::Other
    }
}

tag_enum! {
    /// Units used for ingredient dosages and serving sizes.
    Unit {
        Mg => "mg",
        Mcg => "mcg",
        G => "g",
        Ml => "ml",
        Iu => "iu",
        Cfu => "cfu",
        Capsule => "capsule",
        Tablet => "tablet",
        Softgel => "softgel",
        Scoop => "scoop",
        Gummy => "gummy",
        Drop => "drop",
    }
}

tag_enum! {
    /// Where a record as a whole came from (`meta.source`).
    Source {
        ExternalCatalog => "external-catalog",
        Ai => "ai",
        User => "user",
        Combined => "combined",
    }
}

tag_enum! {
    /// Which data source last set a single field (`meta.sourceMap` values).
    Provenance {
        ExternalCatalog => "external-catalog",
        Ai => "ai",
        User => "user",
        AutoDetected => "auto-detected",
    }
}

impl Provenance {
    /// The contributing source behind this provenance, if it names one.
    pub fn contributor(self) -> Option<Source> {
        match self {
            Provenance::ExternalCatalog => Some(Source::ExternalCatalog),
            Provenance::Ai => Some(Source::Ai),
            Provenance::User => Some(Source::User),
            Provenance::AutoDetected => None,
        }
    }
}

impl From<Source> for Provenance {
    fn from(source: Source) -> Self {
        match source {
            Source::ExternalCatalog => Provenance::ExternalCatalog,
            Source::Ai | Source::Combined => Provenance::Ai,
            Source::User => Provenance::User,
        }
    }
}

tag_enum! {
    /// Record fields that carry provenance. Keys of `meta.sourceMap`.
    Field {
        Barcode => "barcode",
        ProductName => "productName",
        Brand => "brand",
        Category => "category",
        SubCategory => "subCategory",
        Form => "form",
        ServingsPerContainer => "servingsPerContainer",
        ServingSize => "servingSize",
        Ingredients => "ingredients",
        Price => "price",
        Quality => "quality",
    }
}

tag_enum! {
    /// Coarse rating used by the quality analyzer.
    Level {
        Low => "low",
        Medium => "medium",
        High => "high",
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServingSize {
    pub amount: Option<f64>,
    pub unit: Option<Unit>,
}

impl ServingSize {
    pub fn is_empty(&self) -> bool {
        self.amount.is_none() && self.unit.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ingredient {
    pub name: String,
    #[serde(default)]
    pub dosage: Option<f64>,
    #[serde(default)]
    pub unit: Option<Unit>,
    #[serde(default)]
    pub is_standardized: bool,
    #[serde(default)]
    pub standardized_to: Option<String>,
}

impl Ingredient {
    pub fn new(name: impl Into<String>, dosage: Option<f64>, unit: Option<Unit>) -> Self {
        Ingredient {
            name: name.into(),
            dosage,
            unit,
            is_standardized: false,
            standardized_to: None,
        }
    }

    /// Case-insensitive name comparison used when merging ingredient lists.
    pub fn same_name(&self, other: &str) -> bool {
        self.name.trim().to_lowercase() == other.trim().to_lowercase()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Price {
    pub value: Option<f64>,
    pub currency: Option<String>,
    /// Derived from `value / servingsPerContainer`, never set independently
    /// once both operands are known.
    pub price_per_serving: Option<f64>,
}

impl Price {
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.currency.is_none() && self.price_per_serving.is_none()
    }
}

/// Result of the external quality analyzer, stored verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    pub under_dosed: Option<bool>,
    pub over_dosed: Option<bool>,
    pub filler_risk: Option<Level>,
    pub bioavailability: Option<Level>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub source: Source,
    pub verified: bool,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub source_map: BTreeMap<Field, Provenance>,
}

/// The canonical, versioned record for one physical product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplementRecord {
    pub schema_version: u32,
    /// Stable identifier assigned at creation. Never changes afterwards.
    pub id: String,
    pub barcode: Option<String>,
    pub product_name: String,
    pub brand: String,
    pub category: Category,
    pub sub_category: Option<String>,
    pub form: Form,
    pub servings_per_container: Option<f64>,
    #[serde(default)]
    pub serving_size: ServingSize,
    #[serde(default)]
    pub ingredients: Vec<Ingredient>,
    #[serde(default)]
    pub price: Price,
    pub quality: Option<QualityReport>,
    pub meta: Meta,
}

impl SupplementRecord {
    /// Builds a fresh record from a candidate, filling every unset field with
    /// its safe default and tagging each populated field with `source`.
    pub fn from_candidate(
        candidate: &CandidateRecord,
        id: String,
        schema_version: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let source = candidate.source();
        let mut record = SupplementRecord {
            schema_version,
            id,
            barcode: candidate.barcode.clone(),
            product_name: non_empty_or(candidate.product_name.as_deref(), UNKNOWN_PRODUCT),
            brand: non_empty_or(candidate.brand.as_deref(), UNKNOWN_BRAND),
            category: candidate.category.unwrap_or_default(),
            sub_category: candidate.sub_category.clone(),
            form: candidate.form.unwrap_or_default(),
            servings_per_container: candidate.servings_per_container,
            serving_size: candidate.serving_size.clone().unwrap_or_default(),
            ingredients: candidate.ingredients.clone().unwrap_or_default(),
            price: candidate.price.clone().unwrap_or_default(),
            quality: candidate.quality.clone(),
            meta: Meta {
                source,
                verified: false,
                last_updated: now,
                source_map: BTreeMap::new(),
            },
        };
        for field in Field::ALL.iter().copied() {
            if !record.is_unset(field) {
                record.meta.source_map.insert(field, Provenance::from(source));
            }
        }
        record
    }

    /// True when `field` holds null, an empty collection or its default sentinel.
    pub fn is_unset(&self, field: Field) -> bool {
        match field {
            Field::Barcode => self.barcode.as_deref().map_or(true, |b| b.trim().is_empty()),
            Field::ProductName => is_blank_or(&self.product_name, UNKNOWN_PRODUCT),
            Field::Brand => is_blank_or(&self.brand, UNKNOWN_BRAND),
            Field::Category => self.category == Category::default(),
            Field::SubCategory => self.sub_category.as_deref().map_or(true, |s| s.trim().is_empty()),
            Field::Form => self.form == Form::default(),
            Field::ServingsPerContainer => self.servings_per_container.is_none(),
            Field::ServingSize => self.serving_size.is_empty(),
            Field::Ingredients => self.ingredients.is_empty(),
            Field::Price => self.price.is_empty(),
            Field::Quality => self.quality.is_none(),
        }
    }

    pub fn provenance(&self, field: Field) -> Option<Provenance> {
        self.meta.source_map.get(&field).copied()
    }

    pub fn primary_ingredient(&self) -> Option<&str> {
        self.ingredients.first().map(|i| i.name.as_str())
    }
}

/// A partial, unvalidated record as produced by an extraction provider or a
/// user correction form. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CandidateRecord {
    pub barcode: Option<String>,
    pub product_name: Option<String>,
    pub brand: Option<String>,
    pub category: Option<Category>,
    pub sub_category: Option<String>,
    pub form: Option<Form>,
    pub servings_per_container: Option<f64>,
    pub serving_size: Option<ServingSize>,
    pub ingredients: Option<Vec<Ingredient>>,
    pub price: Option<Price>,
    pub quality: Option<QualityReport>,
    /// Provider that produced this candidate. Defaults to [`Source::Ai`].
    pub source: Option<Source>,
}

impl CandidateRecord {
    pub fn source(&self) -> Source {
        self.source.unwrap_or(Source::Ai)
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    /// Whether this candidate carries a value for `field`. Blank names and
    /// brands count as absent.
    pub fn supplies(&self, field: Field) -> bool {
        match field {
            Field::Barcode => self.barcode.is_some(),
            Field::ProductName => self.product_name.as_deref().is_some_and(|n| !n.trim().is_empty()),
            Field::Brand => self.brand.as_deref().is_some_and(|b| !b.trim().is_empty()),
            Field::Category => self.category.is_some(),
            Field::SubCategory => self.sub_category.is_some(),
            Field::Form => self.form.is_some(),
            Field::ServingsPerContainer => self.servings_per_container.is_some(),
            Field::ServingSize => self.serving_size.is_some(),
            Field::Ingredients => self.ingredients.is_some(),
            Field::Price => self.price.is_some(),
            Field::Quality => self.quality.is_some(),
        }
    }

    pub fn primary_ingredient(&self) -> Option<&str> {
        self.ingredients
            .as_ref()
            .and_then(|list| list.first())
            .map(|i| i.name.as_str())
    }
}

fn non_empty_or(value: Option<&str>, fallback: &str) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => fallback.to_string(),
    }
}

fn is_blank_or(value: &str, sentinel: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed == sentinel
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_parse_case_insensitively() {
        assert_eq!("Capsule".parse::<Form>(), Ok(Form::Capsule));
        assert_eq!("amino-acid".parse::<Category>(), Ok(Category::AminoAcid));
        assert_eq!("AUTO-DETECTED".parse::<Provenance>(), Ok(Provenance::AutoDetected));
        assert!("softgels".parse::<Form>().is_err());
    }

    #[test]
    fn source_map_keys_serialize_as_field_names() {
        let mut map = BTreeMap::new();
        map.insert(Field::ProductName, Provenance::User);
        map.insert(Field::SubCategory, Provenance::AutoDetected);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"productName":"user","subCategory":"auto-detected"}"#);
    }

    #[test]
    fn from_candidate_fills_sentinels_and_tracks_populated_fields() {
        let candidate = CandidateRecord {
            product_name: Some("Omega 3".into()),
            servings_per_container: Some(60.0),
            source: Some(Source::ExternalCatalog),
            ..Default::default()
        };
        let record = SupplementRecord::from_candidate(&candidate, "id-1".into(), 1, Utc::now());

        assert_eq!(record.brand, UNKNOWN_BRAND);
        assert_eq!(record.form, Form::Other);
        assert!(record.is_unset(Field::Brand));
        assert!(!record.is_unset(Field::ProductName));
        assert_eq!(record.provenance(Field::ProductName), Some(Provenance::ExternalCatalog));
        assert_eq!(record.provenance(Field::ServingsPerContainer), Some(Provenance::ExternalCatalog));
        assert_eq!(record.provenance(Field::Brand), None);
        assert_eq!(record.meta.source, Source::ExternalCatalog);
        assert!(!record.meta.verified);
    }
}

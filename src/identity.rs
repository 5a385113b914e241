//! Identity resolution.
//!
//! A product is identified by its barcode when it has one. Without a barcode
//! (or when scanned in a context that produced none) the fallback identity is
//! the normalized key: a SHA-256 over brand, product name, primary ingredient
//! and form.

use sha2::{Digest, Sha256};

use crate::supplement_model::{
    CandidateRecord, Form, SupplementRecord, UNKNOWN_BRAND, UNKNOWN_PRODUCT,
};

/// Anything that carries the fields identity resolution reads.
pub trait IdentityFields {
    fn identity_brand(&self) -> &str;
    fn identity_name(&self) -> &str;
    fn identity_primary_ingredient(&self) -> Option<&str>;
    fn identity_form(&self) -> Form;
    fn identity_barcode(&self) -> Option<&str>;
}

impl IdentityFields for SupplementRecord {
    fn identity_brand(&self) -> &str {
        &self.brand
    }

    fn identity_name(&self) -> &str {
        &self.product_name
    }

    fn identity_primary_ingredient(&self) -> Option<&str> {
        self.primary_ingredient()
    }

    fn identity_form(&self) -> Form {
        self.form
    }

    fn identity_barcode(&self) -> Option<&str> {
        self.barcode.as_deref()
    }
}

// Candidates resolve against the defaults a new record would be created
// with, so an unbranded candidate matches an "Unknown Brand" record.
impl IdentityFields for CandidateRecord {
    fn identity_brand(&self) -> &str {
        match self.brand.as_deref().map(str::trim) {
            Some(b) if !b.is_empty() => b,
            _ => UNKNOWN_BRAND,
        }
    }

    fn identity_name(&self) -> &str {
        match self.product_name.as_deref().map(str::trim) {
            Some(n) if !n.is_empty() => n,
            _ => UNKNOWN_PRODUCT,
        }
    }

    fn identity_primary_ingredient(&self) -> Option<&str> {
        self.primary_ingredient()
    }

    fn identity_form(&self) -> Form {
        self.form.unwrap_or_default()
    }

    fn identity_barcode(&self) -> Option<&str> {
        self.barcode.as_deref().map(str::trim).filter(|b| !b.is_empty())
    }
}

/// Deterministic fallback identity of a record or candidate.
pub fn normalized_key<T: IdentityFields + ?Sized>(value: &T) -> String {
    let mut hasher = Sha256::new();
    for part in [
        value.identity_brand(),
        value.identity_name(),
        value.identity_primary_ingredient().unwrap_or(""),
    ] {
        hasher.update(part.trim().to_lowercase().as_bytes());
        hasher.update([0x1fu8]);
    }
    hasher.update(value.identity_form().as_str().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// How a candidate was matched against the stored set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Exact barcode match. Always wins over a key match.
    Barcode(usize),
    /// Unique normalized-key match.
    Key(usize),
    /// Several records share the candidate's normalized key. `first` is the
    /// earliest inserted and is the one callers reuse.
    Ambiguous { first: usize, others: Vec<usize> },
    NotFound,
}

impl Resolution {
    pub fn index(&self) -> Option<usize> {
        match self {
            Resolution::Barcode(i) | Resolution::Key(i) => Some(*i),
            Resolution::Ambiguous { first, .. } => Some(*first),
            Resolution::NotFound => None,
        }
    }
}

/// Locates the stored record a candidate refers to.
pub fn resolve(records: &[SupplementRecord], candidate: &CandidateRecord) -> Resolution {
    if let Some(barcode) = candidate.identity_barcode() {
        if let Some(i) = position_by_barcode(records, barcode) {
            return Resolution::Barcode(i);
        }
    }

    let key = normalized_key(candidate);
    let mut matches = records
        .iter()
        .enumerate()
        .filter(|(_, r)| normalized_key(*r) == key)
        .map(|(i, _)| i);

    match matches.next() {
        None => Resolution::NotFound,
        Some(first) => {
            let others: Vec<usize> = matches.collect();
            if others.is_empty() {
                Resolution::Key(first)
            } else {
                Resolution::Ambiguous { first, others }
            }
        }
    }
}

/// Convenience over [`resolve`] returning the matched record itself.
pub fn find_existing<'a>(
    records: &'a [SupplementRecord],
    candidate: &CandidateRecord,
) -> Option<&'a SupplementRecord> {
    resolve(records, candidate).index().map(|i| &records[i])
}

/// `base`, or `base-2`, `base-3`... whichever no record uses yet.
pub fn unique_id(records: &[SupplementRecord], base: String) -> String {
    let mut id = base.clone();
    let mut n = 2;
    while records.iter().any(|r| r.id == id) {
        id = format!("{base}-{n}");
        n += 1;
    }
    id
}

pub fn position_by_barcode(records: &[SupplementRecord], barcode: &str) -> Option<usize> {
    let barcode = barcode.trim();
    records
        .iter()
        .position(|r| r.barcode.as_deref().map(str::trim) == Some(barcode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SCHEMA_VERSION;
    use crate::supplement_model::{Ingredient, Unit};
    use chrono::Utc;

    fn candidate(brand: &str, name: &str, ingredient: &str) -> CandidateRecord {
        CandidateRecord {
            brand: Some(brand.into()),
            product_name: Some(name.into()),
            ingredients: Some(vec![Ingredient::new(ingredient, Some(400.0), Some(Unit::Mg))]),
            form: Some(Form::Capsule),
            ..Default::default()
        }
    }

    fn stored(c: &CandidateRecord) -> SupplementRecord {
        SupplementRecord::from_candidate(c, normalized_key(c), SCHEMA_VERSION, Utc::now())
    }

    #[test]
    fn key_ignores_case_and_surrounding_whitespace() {
        let a = candidate("SOLID", "Magnesium Bisglycinate 400mg", "Magnesium bisglycinate");
        let b = candidate("  solid ", "magnesium bisglycinate 400MG", "MAGNESIUM BISGLYCINATE ");
        assert_eq!(normalized_key(&a), normalized_key(&b));
    }

    #[test]
    fn key_depends_on_form_and_primary_ingredient() {
        let a = candidate("SOLID", "Magnesium", "Magnesium citrate");
        let mut b = a.clone();
        b.form = Some(Form::Powder);
        let c = candidate("SOLID", "Magnesium", "Magnesium oxide");
        assert_ne!(normalized_key(&a), normalized_key(&b));
        assert_ne!(normalized_key(&a), normalized_key(&c));
    }

    #[test]
    fn candidate_and_created_record_share_a_key() {
        let c = CandidateRecord {
            product_name: Some("Vitamin C".into()),
            ..Default::default()
        };
        assert_eq!(normalized_key(&c), normalized_key(&stored(&c)));
    }

    #[test]
    fn barcode_match_wins_over_key_match() {
        let key_twin = stored(&candidate("SOLID", "Omega 3", "Fish oil"));
        let mut with_barcode = stored(&candidate("Other", "Different", "Krill oil"));
        with_barcode.barcode = Some("735000".into());
        let records = vec![key_twin, with_barcode];

        let mut probe = candidate("SOLID", "Omega 3", "Fish oil");
        probe.barcode = Some("735000".into());
        assert_eq!(resolve(&records, &probe), Resolution::Barcode(1));
    }

    #[test]
    fn collisions_resolve_to_first_inserted_and_are_reported() {
        let c = candidate("SOLID", "Zinc", "Zinc");
        let mut first = stored(&c);
        first.id = "first".into();
        let mut second = stored(&c);
        second.id = "second".into();
        let records = vec![first, second];

        assert_eq!(
            resolve(&records, &c),
            Resolution::Ambiguous { first: 0, others: vec![1] }
        );
        assert_eq!(find_existing(&records, &c).map(|r| r.id.as_str()), Some("first"));
    }

    #[test]
    fn unknown_candidate_is_not_found() {
        let records = vec![stored(&candidate("SOLID", "Zinc", "Zinc"))];
        assert_eq!(
            resolve(&records, &candidate("SOLID", "Iron", "Iron")),
            Resolution::NotFound
        );
    }
}

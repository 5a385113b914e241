//! Contracts for the pure functions the store consults but does not own.
//!
//! Both traits are called with plain values and must not block on I/O for
//! long; the store always calls them before it takes its write lock.

use std::sync::Arc;

use crate::error::CollaboratorError;
use crate::supplement_model::{Category, Ingredient, QualityReport, SupplementRecord};

/// Confidence a classification must exceed before the store adopts it
/// without a human in the loop.
pub const AUTO_DETECT_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub category: Category,
    pub sub_category: Option<String>,
    /// In `0.0..=1.0`.
    pub confidence: f64,
}

pub trait CategoryClassifier: Send + Sync {
    /// Must accept an empty ingredient list.
    fn classify(
        &self,
        product_name: &str,
        ingredients: &[Ingredient],
    ) -> Result<Classification, CollaboratorError>;
}

pub trait QualityAnalyzer: Send + Sync {
    fn analyze(&self, record: &SupplementRecord) -> Result<QualityReport, CollaboratorError>;
}

/// The collaborators a store instance is wired with.
#[derive(Clone)]
pub struct Collaborators {
    pub classifier: Arc<dyn CategoryClassifier>,
    /// When absent, `quality` is only ever what callers supply.
    pub quality: Option<Arc<dyn QualityAnalyzer>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Collaborators {
            classifier: Arc::new(KeywordClassifier),
            quality: None,
        }
    }
}

impl Collaborators {
    pub fn with_classifier(mut self, classifier: Arc<dyn CategoryClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_quality(mut self, analyzer: Arc<dyn QualityAnalyzer>) -> Self {
        self.quality = Some(analyzer);
        self
    }
}

// Order matters: minerals are checked before amino acids so chelates such as
// "bisglycinate" land on the mineral.
const KEYWORDS: &[(&str, Category, Option<&str>)] = &[
    ("multivitamin", Category::Vitamin, Some("multivitamin")),
    ("vitamin d", Category::Vitamin, Some("vitamin-d")),
    ("d3", Category::Vitamin, Some("vitamin-d")),
    ("vitamin c", Category::Vitamin, Some("vitamin-c")),
    ("ascorbic", Category::Vitamin, Some("vitamin-c")),
    ("b12", Category::Vitamin, Some("vitamin-b12")),
    ("b-complex", Category::Vitamin, Some("b-complex")),
    ("folate", Category::Vitamin, Some("folate")),
    ("biotin", Category::Vitamin, Some("biotin")),
    ("vitamin", Category::Vitamin, None),
    ("magnesium", Category::Mineral, Some("magnesium")),
    ("zinc", Category::Mineral, Some("zinc")),
    ("iron", Category::Mineral, Some("iron")),
    ("calcium", Category::Mineral, Some("calcium")),
    ("selenium", Category::Mineral, Some("selenium")),
    ("potassium", Category::Mineral, Some("potassium")),
    ("iodine", Category::Mineral, Some("iodine")),
    ("omega", Category::FattyAcid, Some("omega-3")),
    ("fish oil", Category::FattyAcid, Some("omega-3")),
    ("krill", Category::FattyAcid, Some("omega-3")),
    ("epa", Category::FattyAcid, Some("omega-3")),
    ("dha", Category::FattyAcid, Some("omega-3")),
    ("probiotic", Category::Probiotic, None),
    ("lactobacillus", Category::Probiotic, None),
    ("bifidobacterium", Category::Probiotic, None),
    ("whey", Category::Protein, Some("whey")),
    ("casein", Category::Protein, Some("casein")),
    ("protein", Category::Protein, None),
    ("theanine", Category::AminoAcid, Some("l-theanine")),
    ("carnitine", Category::AminoAcid, Some("l-carnitine")),
    ("glutamine", Category::AminoAcid, Some("glutamine")),
    ("glycine", Category::AminoAcid, Some("glycine")),
    ("taurine", Category::AminoAcid, Some("taurine")),
    ("bcaa", Category::AminoAcid, Some("bcaa")),
    ("ashwagandha", Category::Herb, Some("adaptogen")),
    ("rhodiola", Category::Herb, Some("adaptogen")),
    ("ginseng", Category::Herb, Some("adaptogen")),
    ("turmeric", Category::Herb, Some("turmeric")),
    ("curcumin", Category::Herb, Some("turmeric")),
    ("ginkgo", Category::Herb, None),
    ("echinacea", Category::Herb, None),
    ("valerian", Category::Herb, None),
    ("extract", Category::Herb, None),
];

/// Conservative keyword matcher. Used when no smarter classifier is wired in
/// and as the fallback during legacy migration.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    fn first_match(text: &str) -> Option<(Category, Option<&'static str>)> {
        KEYWORDS
            .iter()
            .find(|(keyword, _, _)| contains_word(text, keyword))
            .map(|(_, category, sub)| (*category, *sub))
    }
}

impl CategoryClassifier for KeywordClassifier {
    fn classify(
        &self,
        product_name: &str,
        ingredients: &[Ingredient],
    ) -> Result<Classification, CollaboratorError> {
        let name = product_name.to_lowercase();
        let ingredient_text = ingredients
            .iter()
            .map(|i| i.name.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ");

        let by_name = Self::first_match(&name);
        let by_ingredients = Self::first_match(&ingredient_text);

        let classification = match (by_name, by_ingredients) {
            (Some((cat, sub)), Some((other, other_sub))) if cat == other => Classification {
                category: cat,
                sub_category: sub.or(other_sub).map(str::to_string),
                confidence: 0.95,
            },
            (Some((cat, sub)), _) => Classification {
                category: cat,
                sub_category: sub.map(str::to_string),
                confidence: 0.85,
            },
            (None, Some((cat, sub))) => Classification {
                category: cat,
                sub_category: sub.map(str::to_string),
                confidence: 0.7,
            },
            (None, None) => Classification {
                category: Category::Supplement,
                sub_category: None,
                confidence: 0.2,
            },
        };
        Ok(classification)
    }
}

/// Matches `needle` at a word start so "iron" does not match "environment".
fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(at, _)| {
        haystack[..at]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supplement_model::Unit;

    #[test]
    fn name_keyword_classifies_vitamins() {
        let c = KeywordClassifier
            .classify("Vitamin D3 2000 IU - 365 capsules", &[])
            .unwrap();
        assert_eq!(c.category, Category::Vitamin);
        assert_eq!(c.sub_category.as_deref(), Some("vitamin-d"));
        assert!(c.confidence > AUTO_DETECT_THRESHOLD);
    }

    #[test]
    fn chelated_minerals_are_minerals() {
        let ingredients = [Ingredient::new("Magnesium bisglycinate", Some(400.0), Some(Unit::Mg))];
        let c = KeywordClassifier
            .classify("Magnesium Bisglycinate 400mg", &ingredients)
            .unwrap();
        assert_eq!(c.category, Category::Mineral);
        assert_eq!(c.confidence, 0.95);
    }

    #[test]
    fn ingredient_only_match_stays_below_threshold() {
        let ingredients = [Ingredient::new("Ashwagandha root extract", None, None)];
        let c = KeywordClassifier.classify("Calm Blend", &ingredients).unwrap();
        assert_eq!(c.category, Category::Herb);
        assert!(c.confidence <= AUTO_DETECT_THRESHOLD);
    }

    #[test]
    fn unknown_product_falls_back_to_generic_supplement() {
        let c = KeywordClassifier.classify("", &[]).unwrap();
        assert_eq!(c.category, Category::Supplement);
        assert!(c.confidence < 0.5);
    }

    #[test]
    fn keywords_match_at_word_starts_only() {
        assert!(contains_word("iron bisglycinate", "iron"));
        assert!(!contains_word("environment friendly", "iron"));
    }
}

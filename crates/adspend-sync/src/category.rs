//! Category normalization against a versioned alias table.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use adspend_core::CanonicalCategory;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use strsim::jaro_winkler;

pub const BUILTIN_TABLE_VERSION: u32 = 1;
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.94;

const MAX_NGRAM_WORDS: usize = 3;
const MIN_FUZZY_ALIAS_LEN: usize = 5;

const BUILTIN_ALIASES: &[(CanonicalCategory, &[&str])] = &[
    (
        CanonicalCategory::PlayMats,
        &["playmat", "play mat", "activity mat", "play gym", "crawling mat", "foam mat", "tummy time mat"],
    ),
    (
        CanonicalCategory::BathMats,
        &["bath mat", "bath rug", "tub mat", "shower mat"],
    ),
    (
        CanonicalCategory::HighChairs,
        &["high chair", "feeding chair", "booster seat"],
    ),
    (CanonicalCategory::Bibs, &["bib", "silicone bib", "bandana bib"]),
    (
        CanonicalCategory::Teethers,
        &["teether", "teething ring", "teething toy"],
    ),
    (
        CanonicalCategory::Blankets,
        &["blanket", "receiving blanket", "throw blanket"],
    ),
    (
        CanonicalCategory::MultiCategory,
        &["multi category", "multicategory", "bundle", "gift set"],
    ),
];

#[derive(Debug, Clone, Deserialize)]
struct CategoryRulesFile {
    version: u32,
    #[serde(default)]
    categories: Vec<CategoryRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryRule {
    category: CanonicalCategory,
    aliases: Vec<String>,
}

/// Lowercases, strips everything but ASCII alphanumerics and drops one
/// trailing plural `s`, so `Play Mats`, `play-mat` and `Playmat` collapse.
pub fn squash(label: &str) -> String {
    let mut out: String = label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    if out.len() > 3 && out.ends_with('s') && !out.ends_with("ss") {
        out.pop();
    }
    out
}

/// Pure mapping from free-text labels to [`CanonicalCategory`].
///
/// A label is split on joiners (`+ & , / |`, ` and `, ` - `). Within each
/// part the longest run of up to three words matching an alias wins; a part
/// with no exact hit falls back to Jaro-Winkler against longer aliases. One
/// distinct category maps to itself, several map to `Multi Category`, none to
/// `Uncategorized`.
#[derive(Debug, Clone)]
pub struct CategoryNormalizer {
    version: u32,
    aliases: BTreeMap<String, CanonicalCategory>,
}

impl Default for CategoryNormalizer {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CategoryNormalizer {
    pub fn builtin() -> Self {
        let mut normalizer = Self {
            version: BUILTIN_TABLE_VERSION,
            aliases: BTreeMap::new(),
        };
        for category in CanonicalCategory::ALL {
            if category.is_specific() {
                normalizer.insert_alias(category.as_str(), category);
            }
        }
        for (category, aliases) in BUILTIN_ALIASES {
            for alias in aliases.iter() {
                normalizer.insert_alias(alias, *category);
            }
        }
        normalizer
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("categories.yaml");
        if !path.exists() {
            return Ok(Self::builtin());
        }
        Self::from_rules_file(&path)
    }

    pub fn from_rules_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::builtin()
            .extended_with_yaml(&text)
            .with_context(|| format!("parsing {}", path.display()))
    }

    pub fn extended_with_yaml(mut self, yaml: &str) -> Result<Self> {
        let rules: CategoryRulesFile = serde_yaml::from_str(yaml)?;
        if rules.version < self.version {
            bail!(
                "category rules version {} is older than the built-in table version {}",
                rules.version,
                self.version
            );
        }
        for rule in &rules.categories {
            for alias in &rule.aliases {
                self.insert_alias(alias, rule.category);
            }
        }
        self.version = rules.version;
        Ok(self)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    fn insert_alias(&mut self, alias: &str, category: CanonicalCategory) {
        let key = squash(alias);
        if !key.is_empty() {
            self.aliases.insert(key, category);
        }
    }

    pub fn normalize(&self, raw: &str) -> CanonicalCategory {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return CanonicalCategory::Uncategorized;
        }
        if let Some(category) = CanonicalCategory::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(trimmed))
        {
            return category;
        }
        if let Some(category) = self.aliases.get(&squash(trimmed)) {
            return *category;
        }

        let mut found = BTreeSet::new();
        for part in split_parts(trimmed) {
            let hits = self.exact_hits(&part);
            if hits.is_empty() {
                if let Some(category) = self.fuzzy_hit(&part) {
                    found.insert(category);
                }
            } else {
                found.extend(hits);
            }
        }

        let mut found = found.into_iter();
        match (found.next(), found.next()) {
            (None, _) => CanonicalCategory::Uncategorized,
            (Some(only), None) => only,
            (Some(_), Some(_)) => CanonicalCategory::MultiCategory,
        }
    }

    fn exact_hits(&self, part: &str) -> Vec<CanonicalCategory> {
        let words: Vec<&str> = part.split_whitespace().collect();
        let mut hits = Vec::new();
        let mut idx = 0;
        'words: while idx < words.len() {
            let longest = MAX_NGRAM_WORDS.min(words.len() - idx);
            for n in (1..=longest).rev() {
                let key = squash(&words[idx..idx + n].join(" "));
                if let Some(category) = self.aliases.get(&key) {
                    hits.push(*category);
                    idx += n;
                    continue 'words;
                }
            }
            idx += 1;
        }
        hits
    }

    fn fuzzy_hit(&self, part: &str) -> Option<CanonicalCategory> {
        let key = squash(part);
        if key.len() < MIN_FUZZY_ALIAS_LEN {
            return None;
        }
        self.aliases
            .iter()
            .filter(|(alias, _)| alias.len() >= MIN_FUZZY_ALIAS_LEN)
            .map(|(alias, category)| (jaro_winkler(&key, alias), *category))
            .filter(|(score, _)| *score >= DEFAULT_FUZZY_THRESHOLD)
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, category)| category)
    }
}

fn split_parts(label: &str) -> Vec<String> {
    let lowered = label.to_ascii_lowercase();
    let joined = lowered.replace(" - ", "|").replace(" and ", "|");
    joined
        .split(['+', '&', ',', '/', '|'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spelling_variants_collapse_to_play_mats() {
        let normalizer = CategoryNormalizer::builtin();
        for raw in ["Playmat", "Play Mat", "play-mat", "PLAY MATS", "playmats"] {
            assert_eq!(normalizer.normalize(raw), CanonicalCategory::PlayMats, "{raw}");
        }
        assert_eq!(normalizer.normalize("Play Mat").as_str(), "Play Mats");
    }

    #[test]
    fn canonical_names_are_fixed_points() {
        let normalizer = CategoryNormalizer::builtin();
        for category in CanonicalCategory::ALL {
            assert_eq!(normalizer.normalize(category.as_str()), category);
            let again = normalizer.normalize(normalizer.normalize(category.as_str()).as_str());
            assert_eq!(again, category);
        }
    }

    #[test]
    fn unknown_labels_fall_back_without_failing() {
        let normalizer = CategoryNormalizer::builtin();
        assert_eq!(normalizer.normalize(""), CanonicalCategory::Uncategorized);
        assert_eq!(normalizer.normalize("Stroller"), CanonicalCategory::Uncategorized);
        assert_eq!(normalizer.normalize("   "), CanonicalCategory::Uncategorized);
    }

    #[test]
    fn joined_categories_become_multi_category() {
        let normalizer = CategoryNormalizer::builtin();
        assert_eq!(
            normalizer.normalize("Bibs & Teethers | Bundle"),
            CanonicalCategory::MultiCategory
        );
        assert_eq!(
            normalizer.normalize("Bath Mat + High Chair"),
            CanonicalCategory::MultiCategory
        );
    }

    #[test]
    fn campaign_names_resolve_through_word_runs() {
        let normalizer = CategoryNormalizer::builtin();
        assert_eq!(normalizer.normalize("Playmats | Prospecting"), CanonicalCategory::PlayMats);
        assert_eq!(normalizer.normalize("Play Mats - Search"), CanonicalCategory::PlayMats);
        assert_eq!(normalizer.normalize("Summer High Chairs Sale"), CanonicalCategory::HighChairs);
    }

    #[test]
    fn near_miss_spelling_matches_fuzzily() {
        let normalizer = CategoryNormalizer::builtin();
        assert_eq!(normalizer.normalize("Playmatt"), CanonicalCategory::PlayMats);
        assert_eq!(normalizer.normalize("Blankett"), CanonicalCategory::Blankets);
        assert_eq!(normalizer.normalize("Prospecting"), CanonicalCategory::Uncategorized);
    }

    #[test]
    fn yaml_rules_extend_the_table_and_bump_version() {
        let normalizer = CategoryNormalizer::builtin();
        assert_eq!(normalizer.normalize("Swaddle"), CanonicalCategory::Uncategorized);

        let extended = normalizer
            .extended_with_yaml(
                "version: 2\ncategories:\n  - category: Blankets\n    aliases: [swaddle, sleep sack]\n",
            )
            .unwrap();
        assert_eq!(extended.version(), 2);
        assert_eq!(extended.normalize("Swaddle"), CanonicalCategory::Blankets);
        assert_eq!(extended.normalize("Sleep-Sack"), CanonicalCategory::Blankets);
        assert_eq!(extended.normalize("Play Mat"), CanonicalCategory::PlayMats);
    }

    #[test]
    fn stale_rules_version_is_rejected() {
        let err = CategoryNormalizer::builtin()
            .extended_with_yaml("version: 0\ncategories: []\n")
            .unwrap_err();
        assert!(err.to_string().contains("older"));
    }

    #[test]
    fn normalization_is_deterministic() {
        let normalizer = CategoryNormalizer::builtin();
        let first: Vec<_> = ["Bib", "Teething Ring", "Tub Mat"]
            .iter()
            .map(|raw| normalizer.normalize(raw))
            .collect();
        assert_eq!(
            first,
            vec![
                CanonicalCategory::Bibs,
                CanonicalCategory::Teethers,
                CanonicalCategory::BathMats
            ]
        );
    }
}

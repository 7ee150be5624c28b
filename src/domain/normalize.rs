// src/domain/normalize.rs
//
// C1 — Name Normalizer (spec §4.1). Canonicalizes building names for
// equality/search: width folding, hiragana→katakana, case fold, symbol
// strip, branch-suffix strip.

use once_cell::sync::Lazy;
use regex::Regex;

/// Symbols stripped during canonicalization (spec §4.1).
const CANONICAL_SYMBOLS: &[char] = &[
    '・', '·', '〜', '～', '—', '–', '−', 'ー', '-', '/', '／', ',',
];

/// Trailing branch-wing suffixes stripped during canonicalization.
const BRANCH_SUFFIXES: &[&str] = &[
    "EAST", "WEST", "NORTH", "SOUTH", "E棟", "W棟", "N棟", "S棟", "東棟", "西棟", "南棟", "北棟",
    "棟",
];

fn hiragana_to_katakana(s: &str) -> String {
    s.chars()
        .map(|c| {
            if ('\u{3040}'..='\u{309f}').contains(&c) {
                char::from_u32(c as u32 + 0x60).unwrap_or(c)
            } else {
                c
            }
        })
        .collect()
}

/// Full-width ASCII digits/letters → half-width. Full-width forms live
/// in U+FF01..U+FF5E, which is a fixed 0xFEE0 offset from the half-width
/// equivalent; full-width space (U+3000) maps to U+0020 separately.
fn fold_width(s: &str) -> String {
    const FULLWIDTH_START: u32 = 0xff01;
    const FULLWIDTH_END: u32 = 0xff5e;
    s.chars()
        .map(|c| {
            let cp = c as u32;
            if (FULLWIDTH_START..=FULLWIDTH_END).contains(&cp) {
                char::from_u32(cp - 0xfee0).unwrap_or(c)
            } else if c == '\u{3000}' {
                ' '
            } else {
                c
            }
        })
        .collect()
}

fn collapse_whitespace(s: &str) -> String {
    static WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
    WS.replace_all(s.trim(), " ").to_string()
}

/// Display/equality form: width-fold, hiragana→katakana, case-fold to
/// uppercase, collapse whitespace, trim. Symbols are preserved.
pub fn normalize(name: &str) -> String {
    let katakana = hiragana_to_katakana(name);
    let folded = fold_width(&katakana);
    let upper = folded.to_uppercase();
    collapse_whitespace(&upper)
}

/// Search-key form: `normalize`, then strip all whitespace and the
/// canonical symbol set, then strip a trailing branch suffix.
pub fn canonicalize(name: &str) -> String {
    let normalized = normalize(name);
    let mut stripped: String = normalized
        .chars()
        .filter(|c| !c.is_whitespace() && !CANONICAL_SYMBOLS.contains(c))
        .collect();

    for suffix in BRANCH_SUFFIXES {
        if let Some(rest) = stripped.strip_suffix(suffix) {
            if !rest.is_empty() {
                stripped = rest.to_string();
                break;
            }
        }
    }
    stripped
}

/// Heuristic ad-copy detector (spec §4.1). Flagged names are admissible
/// as listing-level names but must never win a building's primary name
/// vote and get their vote weight cut to 0.1 (§4.3 rule 4).
pub fn is_advertising_text(s: &str) -> bool {
    static BRACKETED: Lazy<Regex> = Lazy::new(|| Regex::new(r"≪.+≫|【.+】").unwrap());
    static STATION_WALK: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"徒歩\s*\d+\s*分|駅\s*徒歩|\d+\s*min\s*walk").unwrap());
    static PRICE_IN_TEXT: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\d+(万円|億円)|[¥￥]\s*\d").unwrap());
    static LAYOUT_WHOLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+(S|L|D|K)+$").unwrap());
    static BUILDING_AGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"築\d+年|新築").unwrap());

    let normalized = normalize(s);
    if normalized.chars().count() < 3 {
        return true;
    }
    BRACKETED.is_match(s)
        || STATION_WALK.is_match(s)
        || PRICE_IN_TEXT.is_match(s)
        || LAYOUT_WHOLE.is_match(&normalized)
        || BUILDING_AGE.is_match(s)
}

/// A deduplicated set of search-pattern variants for a user query,
/// ORed against `normalized_name`, `canonical_name`, and
/// `building_listing_names.canonical_name` with `ILIKE '%…%'` by the
/// caller (kept as a typed value per the redesign flag in spec §9,
/// rather than interpolated SQL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPatternSet {
    patterns: Vec<String>,
}

impl SearchPatternSet {
    pub fn expand(query: &str) -> Self {
        let mut patterns = Vec::new();
        let mut push = |p: String| {
            if !p.is_empty() && !patterns.contains(&p) {
                patterns.push(p);
            }
        };

        push(normalize(query));
        push(canonicalize(query));
        push(normalize(query).replace('・', ""));
        push(normalize(query).replace(' ', ""));

        let fullwidth_upper: String = normalize(query)
            .chars()
            .map(|c| match c {
                'A'..='Z' => char::from_u32('Ａ' as u32 + (c as u32 - 'A' as u32)).unwrap_or(c),
                '0'..='9' => char::from_u32('０' as u32 + (c as u32 - '0' as u32)).unwrap_or(c),
                ' ' => '\u{3000}',
                other => other,
            })
            .collect();
        push(fullwidth_upper);

        static HYPHENS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ーｰ－—–−-]").unwrap());
        let hyphen_normalized = HYPHENS.replace_all(&normalize(query), "-").to_string();
        push(hyphen_normalized);

        SearchPatternSet { patterns }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Builds the OR-joined `ILIKE` fragment and bind values for the
    /// given columns, e.g. `normalized_name`/`canonical_name`.
    pub fn to_sql_or(&self, columns: &[&str]) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();
        for col in columns {
            for pattern in &self.patterns {
                clauses.push(format!("{col} LIKE ?"));
                binds.push(format!("%{pattern}%"));
            }
        }
        (clauses.join(" OR "), binds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_width_and_kana_and_case() {
        assert_eq!(normalize("ｈｅｌｌｏ"), "HELLO");
        assert_eq!(normalize("しろかね"), "シロカネ");
        assert_eq!(normalize("  白金  ザ   スカイ "), "白金 ザ スカイ");
    }

    #[test]
    fn canonicalize_strips_symbols_and_branch_suffix() {
        assert_eq!(canonicalize("白金ザ・スカイ"), canonicalize("白金ザスカイ"));
        assert_eq!(canonicalize("白金タワー EAST"), canonicalize("白金タワー"));
        assert_eq!(canonicalize("白金タワー東棟"), canonicalize("白金タワー"));
    }

    #[test]
    fn ad_copy_detection() {
        assert!(is_advertising_text("【新築】駅徒歩5分の好立地！"));
        assert!(is_advertising_text("ab"));
        assert!(is_advertising_text("3LDK"));
        assert!(!is_advertising_text("白金ザ・スカイ"));
    }

    #[test]
    fn search_patterns_include_canonical_and_nakaguro_variants() {
        let set = SearchPatternSet::expand("白金ざ すかい");
        assert!(set.patterns().iter().any(|p| p == &canonicalize("白金ざ すかい")));
    }
}

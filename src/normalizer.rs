//! Text and URL normalization primitives shared by the bank, scorer, and extractors.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use url::Url;

/// Shortest keyword accepted by [`is_good_keyword`], in characters.
pub const MIN_KEYWORD_CHARS: usize = 2;
/// Longest keyword accepted by [`is_good_keyword`], in characters.
pub const MAX_KEYWORD_CHARS: usize = 80;

/// Maps a string to its matching form: lowercase, accent-folded, whitespace collapsed.
///
/// The mapping is total and idempotent, so it is safe to apply to already-normalized terms.
pub fn normalize(input: &str) -> String {
    let folded: String = input
        .to_lowercase()
        .nfd()
        .filter(|ch| !is_combining_mark(*ch))
        .collect();
    collapse_whitespace(&folded)
}

/// Trims and collapses every run of whitespace (including NBSP) into a single space.
pub fn collapse_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for word in input.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Returns at most `max` characters of `input`, never splitting a code point.
pub fn truncate_chars(input: &str, max: usize) -> &str {
    match input.char_indices().nth(max) {
        Some((idx, _)) => &input[..idx],
        None => input,
    }
}

/// Resolves `raw` against `base` and strips the fragment.
///
/// Only `http`/`https` targets count as canonical posting URLs.
pub fn canonical_url(base: &Url, raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut url = base.join(raw).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.set_fragment(None);
    Some(url)
}

/// Heuristic filter rejecting scraped junk (hashes, ids, punctuation soup) from a keyword corpus.
pub fn is_good_keyword(raw: &str) -> bool {
    let s = collapse_whitespace(raw);
    let len = s.chars().count();
    if !(MIN_KEYWORD_CHARS..=MAX_KEYWORD_CHARS).contains(&len) {
        return false;
    }
    if is_uuid(&s) || is_hex_digest(&s) || is_base64ish(&s) {
        return false;
    }
    if s.chars().all(|ch| ch.is_ascii_digit()) {
        return false;
    }
    if !s.chars().any(char::is_alphabetic) {
        return false;
    }
    let alnum = s.chars().filter(|ch| ch.is_alphanumeric()).count();
    alnum as f64 / len as f64 >= 0.4
}

/// Filters, de-duplicates (case-insensitively), and sorts a raw keyword list.
///
/// The first spelling of each keyword wins.
pub fn clean_keywords<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut cleaned = Vec::new();
    for item in raw {
        let item = item.as_ref();
        if !is_good_keyword(item) {
            continue;
        }
        let keyword = collapse_whitespace(item);
        if seen.insert(keyword.to_lowercase()) {
            cleaned.push(keyword);
        }
    }
    cleaned.sort_by_cached_key(|keyword| (normalize(keyword), keyword.clone()));
    cleaned
}

fn is_uuid(s: &str) -> bool {
    let groups: Vec<&str> = s.split('-').collect();
    let lengths = [8, 4, 4, 4, 12];
    groups.len() == lengths.len()
        && groups
            .iter()
            .zip(lengths)
            .all(|(group, len)| group.len() == len && group.chars().all(|c| c.is_ascii_hexdigit()))
}

fn is_hex_digest(s: &str) -> bool {
    (24..=64).contains(&s.len()) && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_base64ish(s: &str) -> bool {
    s.len() >= 24
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_case_accents_and_spacing() {
        assert_eq!(normalize("  Ingénieur   ÉLECTROMÉCANIQUE "), "ingenieur electromecanique");
        assert_eq!(normalize("Métrologie\u{a0}Industrielle"), "metrologie industrielle");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn normalization_is_idempotent() {
        let samples = [
            "PLC Senior",
            "Électricien d'entretien",
            "ÅNGSTRÖM\tçà\n  ",
            "İstanbul ǅemal",
            "Technicien   HMI / SCADA",
            "\u{212b} kelvin \u{212a}",
        ];
        for sample in samples {
            let once = normalize(sample);
            assert_eq!(normalize(&once), once, "not idempotent for {sample:?}");
        }
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("énergie", 3), "éne");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn canonical_url_resolves_relative_links_and_drops_fragments() {
        let base = Url::parse("https://jobs.test/offres?page=2").unwrap();
        let url = canonical_url(&base, "/offre/42#apply").expect("resolves");
        assert_eq!(url.as_str(), "https://jobs.test/offre/42");
        assert!(canonical_url(&base, "mailto:hr@jobs.test").is_none());
        assert!(canonical_url(&base, "   ").is_none());
    }

    #[test]
    fn keyword_hygiene_rejects_junk() {
        assert!(is_good_keyword("Automaticien"));
        assert!(is_good_keyword("SAP/ABAP"));
        assert!(!is_good_keyword("a"));
        assert!(!is_good_keyword("12345"));
        assert!(!is_good_keyword("3f2504e0-4f89-11d3-9a0c-0305e82c3301"));
        assert!(!is_good_keyword("da39a3ee5e6b4b0d3255bfef95601890afd80709"));
        assert!(!is_good_keyword("QUJDREVGR0hJSktMTU5PUFFSU1RVVg=="));
        assert!(!is_good_keyword("--**//!!a"));
    }

    #[test]
    fn clean_keywords_dedupes_and_sorts() {
        let cleaned = clean_keywords(["zèbre", "Automate", "automate", "  école\u{a0}", "42"]);
        assert_eq!(cleaned, vec!["Automate", "école", "zèbre"]);
    }
}

//! Surface-name normalization and similarity for entity resolution.

use std::collections::BTreeSet;

/// Normalize a surface name: lowercase, fold Latin diacritics, drop
/// punctuation, collapse whitespace.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        if let Some(folded) = fold_diacritic(c) {
            out.push_str(folded);
        } else if c.is_alphanumeric() {
            out.push(c);
        } else if c.is_whitespace() || c == '-' || c == '_' || c == '/' {
            out.push(' ');
        }
        // Anything else (., ', &, ...) is dropped.
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fold_diacritic(c: char) -> Option<&'static str> {
    Some(match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => "a",
        'æ' => "ae",
        'ç' | 'ć' | 'č' => "c",
        'ď' | 'đ' => "d",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ę' | 'ě' => "e",
        'ğ' => "g",
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'ı' => "i",
        'ł' | 'ľ' => "l",
        'ñ' | 'ń' | 'ň' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
        'œ' => "oe",
        'ř' => "r",
        'ś' | 'š' | 'ş' => "s",
        'ß' => "ss",
        'ť' | 'ţ' => "t",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' => "u",
        'ý' | 'ÿ' => "y",
        'ź' | 'ż' | 'ž' => "z",
        _ => return None,
    })
}

/// Levenshtein edit distance over chars.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// `1 - distance / max_len`, in [0, 1].
fn edit_ratio(a: &str, b: &str) -> f32 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f32 / max_len as f32
}

/// Token-set ratio: compares the shared tokens against each side's full
/// token set, so word order and repeated words do not matter, and a name
/// that is a token subset of the other scores 1.0.
pub fn token_set_ratio(a: &str, b: &str) -> f32 {
    let ta: BTreeSet<&str> = a.split_whitespace().collect();
    let tb: BTreeSet<&str> = b.split_whitespace().collect();
    if ta.is_empty() || tb.is_empty() {
        return if ta.is_empty() && tb.is_empty() { 1.0 } else { 0.0 };
    }
    let join = |set: BTreeSet<&str>| set.into_iter().collect::<Vec<_>>().join(" ");
    let common = join(ta.intersection(&tb).copied().collect());
    let only_a = join(ta.difference(&tb).copied().collect());
    let only_b = join(tb.difference(&ta).copied().collect());
    if common.is_empty() {
        return edit_ratio(&join(ta), &join(tb));
    }
    let with = |rest: &str| {
        if rest.is_empty() {
            common.clone()
        } else {
            format!("{common} {rest}")
        }
    };
    let combined_a = with(&only_a);
    let combined_b = with(&only_b);
    edit_ratio(&common, &combined_a)
        .max(edit_ratio(&common, &combined_b))
        .max(edit_ratio(&combined_a, &combined_b))
}

/// Similarity of two already-normalized names, in [0, 1].
pub fn name_similarity(a: &str, b: &str) -> f32 {
    if a == b {
        return 1.0;
    }
    token_set_ratio(a, b).max(edit_ratio(a, b))
}

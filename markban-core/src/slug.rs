/// Slug and prefix generation for projects and cards.
use std::collections::HashSet;

use unicode_normalization::UnicodeNormalization;

const MAX_SLUG_LEN: usize = 80;

/// Lowercase, ASCII-only, dash-separated slug. Accents are folded
/// (`Café` -> `cafe`), everything else non-alphanumeric becomes a dash.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;
    for c in text.nfkd() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else if c.is_ascii() || c.is_whitespace() {
            pending_dash = true;
        }
        // Non-ASCII leftovers after NFKD are combining marks: drop them.
    }
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        while slug.ends_with('-') {
            slug.pop();
        }
    }
    slug
}

/// Whether `name` is safe to use as a single path segment inside the
/// workspace (project slug, lane slug, card slug or filename).
pub fn is_valid_segment(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
        && !name.contains("..")
        && !name.starts_with('.')
}

/// 2-4 uppercase ASCII letters.
pub fn is_valid_prefix(prefix: &str) -> bool {
    (2..=4).contains(&prefix.len()) && prefix.chars().all(|c| c.is_ascii_uppercase())
}

/// Pick a card-reference prefix for a project name that is not in `taken`.
pub fn generate_prefix(name: &str, taken: &HashSet<String>) -> Option<String> {
    let words: Vec<String> = name
        .nfkd()
        .collect::<String>()
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_uppercase())
        .collect();
    let letters: String = words.concat();
    if letters.is_empty() {
        return first_free(taken, "MB");
    }

    let mut candidates: Vec<String> = Vec::new();
    if words.len() >= 2 {
        let initials: String = words.iter().filter_map(|w| w.chars().next()).take(4).collect();
        candidates.push(initials);
    }
    for len in [3, 2, 4] {
        if letters.len() >= len {
            candidates.push(letters[..len].to_string());
        }
    }

    for candidate in &candidates {
        if is_valid_prefix(candidate) && !taken.contains(candidate) {
            return Some(candidate.clone());
        }
    }

    let stem: String = letters.chars().take(2).collect();
    let stem = if stem.len() < 2 { format!("{stem}X") } else { stem };
    first_free(taken, &stem)
}

/// `stem` followed by one or two extra letters, first unused wins.
fn first_free(taken: &HashSet<String>, stem: &str) -> Option<String> {
    if is_valid_prefix(stem) && !taken.contains(stem) {
        return Some(stem.to_string());
    }
    let alphabet = 'A'..='Z';
    for a in alphabet.clone() {
        let candidate = format!("{stem}{a}");
        if is_valid_prefix(&candidate) && !taken.contains(&candidate) {
            return Some(candidate);
        }
    }
    for a in alphabet.clone() {
        for b in alphabet.clone() {
            let candidate = format!("{stem}{a}{b}");
            if is_valid_prefix(&candidate) && !taken.contains(&candidate) {
                return Some(candidate);
            }
        }
    }
    None
}

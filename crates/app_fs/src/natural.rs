//! Natural sort ordering
//!
//! Digit runs compare by numeric value, everything else case-insensitively,
//! so "image2.jpg" < "image10.jpg".

use std::cmp::Ordering;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum NaturalSortPart {
    Num(u128),
    Str(String),
}

/// Precomputed natural sort key for a string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaturalKey {
    parts: Vec<NaturalSortPart>,
    raw: String,
}

impl NaturalKey {
    pub fn new(s: &str) -> Self {
        let mut parts = Vec::new();
        let mut current_num = String::new();
        let mut current_str = String::new();

        for c in s.chars() {
            if c.is_ascii_digit() {
                if !current_str.is_empty() {
                    parts.push(NaturalSortPart::Str(current_str.to_lowercase()));
                    current_str.clear();
                }
                current_num.push(c);
            } else {
                if !current_num.is_empty() {
                    parts.push(number_part(&current_num));
                    current_num.clear();
                }
                current_str.push(c);
            }
        }

        if !current_num.is_empty() {
            parts.push(number_part(&current_num));
        }
        if !current_str.is_empty() {
            parts.push(NaturalSortPart::Str(current_str.to_lowercase()));
        }

        Self {
            parts,
            raw: s.to_string(),
        }
    }

    pub fn from_path(path: &Path) -> Self {
        Self::new(&path.to_string_lossy())
    }
}

// Runs too long for u128 fall back to text comparison.
fn number_part(digits: &str) -> NaturalSortPart {
    match digits.parse::<u128>() {
        Ok(n) => NaturalSortPart::Num(n),
        Err(_) => NaturalSortPart::Str(digits.to_string()),
    }
}

impl Ord for NaturalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // "a01" and "a1" have equal parts; the raw string keeps the order total.
        self.parts
            .cmp(&other.parts)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl PartialOrd for NaturalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare two strings in natural order
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    NaturalKey::new(a).cmp(&NaturalKey::new(b))
}

/// Compare two paths in natural order
pub fn natural_path_cmp(a: &Path, b: &Path) -> Ordering {
    NaturalKey::from_path(a).cmp(&NaturalKey::from_path(b))
}

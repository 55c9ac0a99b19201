//! Description / counterparty text comparison.

use std::collections::BTreeSet;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Corporate-form and filler tokens that carry no identifying signal
/// ("S.A. de C.V.", "S. de R.L.", articles).
const NOISE_TOKENS: &[&str] = &[
    "sa", "de", "cv", "sapi", "rl", "srl", "sab", "sc", "ac", "s", "a", "c", "v", "r", "l", "la",
    "el", "los", "las", "y", "del",
];

/// Lowercase, strip diacritics, and fold every non-alphanumeric run into a space.
pub fn normalize(input: &str) -> String {
    let folded: String = input
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn tokens(input: &str) -> BTreeSet<String> {
    normalize(input)
        .split(' ')
        .filter(|t| !t.is_empty() && !NOISE_TOKENS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Overlap coefficient `|A ∩ B| / min(|A|, |B|)` over normalized tokens.
///
/// Statement descriptions usually embed the counterparty name among references
/// and channel codes, so the shorter side is the denominator.
pub fn token_overlap(a: &str, b: &str) -> f64 {
    let left = tokens(a);
    let right = tokens(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let shared = left.intersection(&right).count();
    shared as f64 / left.len().min(right.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_accents_and_punctuation() {
        assert_eq!(normalize("  Papelería  EL ÁGUILA, S.A.  "), "papeleria el aguila s a");
        assert_eq!(normalize("Ñandú-Café"), "nandu cafe");
    }

    #[test]
    fn corporate_suffixes_do_not_count_as_overlap() {
        assert_eq!(token_overlap("FERRETERA SA DE CV", "TELCEL SA DE CV"), 0.0);
    }

    #[test]
    fn description_containing_name_scores_full() {
        let score = token_overlap(
            "PAGO TARJETA COMPRA ORDEN 8823 Farmacias Guadalajara",
            "FARMACIAS GUADALAJARA S.A. DE C.V.",
        );
        assert_eq!(score, 1.0);
    }

    #[test]
    fn partial_overlap() {
        let score = token_overlap("SPEI ACME LOGISTICA", "Acme Transportes");
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn empty_inputs_score_zero() {
        assert_eq!(token_overlap("", "Acme"), 0.0);
        assert_eq!(token_overlap("S.A. de C.V.", "Acme"), 0.0);
    }
}

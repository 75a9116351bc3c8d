use rayon::prelude::*;
use whatlang::Lang;

/// Fewer letters than this is too little to call a language.
const MIN_LETTERS: usize = 3;

/// Guess whether `text` is written in something other than English.
///
/// Any non-ASCII letter counts as foreign; otherwise the statistical
/// detector decides. Text it cannot decide on is treated as English.
pub fn looks_non_english(text: &str) -> bool {
    if text.chars().any(|c| c.is_alphabetic() && !c.is_ascii()) {
        return true;
    }
    if text.chars().filter(|c| c.is_alphabetic()).count() < MIN_LETTERS {
        return false;
    }
    match whatlang::detect_lang(text) {
        Some(lang) => lang != Lang::Eng,
        None => false,
    }
}

/// Indices of the values that look non-English, in ascending order.
pub fn select_non_english<'a, I>(values: I) -> Vec<usize>
where
    I: IntoParallelIterator<Item = (usize, &'a str)>,
{
    let mut picked: Vec<usize> = values
        .into_par_iter()
        .filter(|(_, text)| looks_non_english(text))
        .map(|(i, _)| i)
        .collect();
    picked.sort_unstable();
    picked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_accents_and_scripts() {
        assert!(looks_non_english("Tasse à café"));
        assert!(looks_non_english("コーヒーカップ"));
        assert!(!looks_non_english(""));
        assert!(!looks_non_english("12 x 3 €"));
    }

    #[test]
    fn detects_unaccented_european_names() {
        assert!(looks_non_english("Chaussures de sport pour homme et femme"));
        assert!(looks_non_english("Zapatos de mujer con tacon para la fiesta"));
        assert!(looks_non_english("Kaffeebecher aus Keramik mit Henkel und Deckel"));
        assert!(looks_non_english("Scarpe da ginnastica per uomo e donna"));
    }

    #[test]
    fn english_names_stay_english() {
        assert!(!looks_non_english("Stainless steel coffee mug with a handle"));
        assert!(!looks_non_english("Large ceramic dinner plate for the whole family"));
    }

    #[test]
    fn selects_sorted_indices() {
        let names = vec![
            (0, "Stainless steel coffee mug with a handle"),
            (1, "Becher groß"),
            (2, "Large ceramic dinner plate for the whole family"),
            (3, "Чашка"),
            (4, "Kaffeebecher aus Keramik mit Henkel und Deckel"),
        ];
        assert_eq!(select_non_english(names), vec![1, 3, 4]);
    }
}

//! Edit-distance engine.
//!
//! Pure functions only: both metrics work on Unicode scalar values and use
//! unit costs. `rank` scores every whitespace token of a corpus against a
//! query word and orders the hits by distance.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;

/// How many ranked entries a completed search reports.
pub const MAX_RESULTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    Levenshtein,
    DamerauLevenshtein,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Levenshtein => "levenshtein",
            Algorithm::DamerauLevenshtein => "damerau-levenshtein",
        }
    }

    pub fn distance(&self, a: &str, b: &str) -> usize {
        match self {
            Algorithm::Levenshtein => levenshtein(a, b),
            Algorithm::DamerauLevenshtein => damerau_levenshtein(a, b),
        }
    }
}

impl FromStr for Algorithm {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "levenshtein" => Ok(Algorithm::Levenshtein),
            "damerau-levenshtein" => Ok(Algorithm::DamerauLevenshtein),
            other => Err(ValidationError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One corpus token together with its distance to the query word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedWord {
    pub word: String,
    pub distance: usize,
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    // Two rolling rows instead of the full matrix
    let mut prev_row: Vec<usize> = (0..=b.len()).collect();
    let mut curr_row = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr_row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr_row[j + 1] = (prev_row[j] + cost) // substitution
                .min(prev_row[j + 1] + 1) // deletion
                .min(curr_row[j] + 1); // insertion
        }
        std::mem::swap(&mut prev_row, &mut curr_row);
    }

    prev_row[b.len()]
}

/// Optimal string alignment distance: Levenshtein plus swaps of two
/// adjacent characters. Never larger than [`levenshtein`] for the same pair.
pub fn damerau_levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut matrix = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for (i, row) in matrix.iter_mut().enumerate() {
        row[0] = i;
    }
    for (j, cell) in matrix[0].iter_mut().enumerate() {
        *cell = j;
    }

    for i in 1..=a.len() {
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            let mut best = (matrix[i - 1][j] + 1)
                .min(matrix[i][j - 1] + 1)
                .min(matrix[i - 1][j - 1] + cost);

            if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                best = best.min(matrix[i - 2][j - 2] + 1);
            }

            matrix[i][j] = best;
        }
    }

    matrix[a.len()][b.len()]
}

/// Score every whitespace-separated token of `corpus_text` against `word`.
///
/// Duplicates are kept (one entry per occurrence) and the sort is stable,
/// so equal distances keep their corpus order. The full list is returned;
/// callers truncate to [`MAX_RESULTS`].
pub fn rank(word: &str, corpus_text: &str, algorithm: Algorithm) -> Vec<RankedWord> {
    let mut ranked: Vec<RankedWord> = corpus_text
        .split_whitespace()
        .map(|token| RankedWord {
            word: token.to_string(),
            distance: algorithm.distance(word, token),
        })
        .collect();

    ranked.sort_by_key(|entry| entry.distance);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: &[&str] = &[
        "", "a", "ab", "ba", "abc", "acb", "kitten", "sitting", "flaw", "lawn", "test", "tent",
        "text", "ca", "abc", "naïve", "niave", "Straße",
    ];

    #[test]
    fn test_levenshtein_known_values() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("flaw", "lawn"), 2);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("", ""), 0);
    }

    #[test]
    fn test_transposition_is_cheaper_for_damerau() {
        assert_eq!(damerau_levenshtein("ab", "ba"), 1);
        assert_eq!(levenshtein("ab", "ba"), 2);
        assert_eq!(damerau_levenshtein("abc", "acb"), 1);
        // Optimal string alignment never edits a substring twice
        assert_eq!(damerau_levenshtein("ca", "abc"), 3);
    }

    #[test]
    fn test_metric_properties_over_samples() {
        for a in SAMPLES {
            assert_eq!(levenshtein(a, a), 0);
            assert_eq!(damerau_levenshtein(a, a), 0);
            for b in SAMPLES {
                assert_eq!(levenshtein(a, b), levenshtein(b, a), "{a:?} vs {b:?}");
                assert!(
                    damerau_levenshtein(a, b) <= levenshtein(a, b),
                    "{a:?} vs {b:?}"
                );
            }
        }
    }

    #[test]
    fn test_counts_chars_not_bytes() {
        assert_eq!(levenshtein("naïve", "naive"), 1);
        assert_eq!(levenshtein("", "Straße"), 6);
    }

    #[test]
    fn test_rank_breaks_ties_by_first_occurrence() {
        let ranked = rank("test", "test tent text", Algorithm::Levenshtein);
        let pairs: Vec<(&str, usize)> = ranked
            .iter()
            .map(|r| (r.word.as_str(), r.distance))
            .collect();
        assert_eq!(pairs, vec![("test", 0), ("tent", 1), ("text", 1)]);
    }

    #[test]
    fn test_rank_keeps_duplicates_and_raw_tokens() {
        let ranked = rank("word", "Word  word\tword,\nword", Algorithm::Levenshtein);
        assert_eq!(ranked.len(), 4);
        assert_eq!(ranked[0].word, "word");
        assert_eq!(ranked[1].word, "word");
        assert_eq!(ranked[2].word, "Word");
        assert_eq!(ranked[3].word, "word,");
    }

    #[test]
    fn test_rank_empty_corpus() {
        assert!(rank("word", "   \n ", Algorithm::DamerauLevenshtein).is_empty());
    }

    #[test]
    fn test_algorithm_selector() {
        assert_eq!("levenshtein".parse::<Algorithm>(), Ok(Algorithm::Levenshtein));
        assert_eq!(
            "damerau-levenshtein".parse::<Algorithm>(),
            Ok(Algorithm::DamerauLevenshtein)
        );
        assert_eq!(
            "hamming".parse::<Algorithm>(),
            Err(ValidationError::UnsupportedAlgorithm("hamming".to_string()))
        );
        assert_eq!(Algorithm::DamerauLevenshtein.to_string(), "damerau-levenshtein");
    }
}

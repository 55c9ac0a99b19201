//! Scoring and enumeration of match suggestions.

pub mod generator;
pub mod scorer;
pub mod subset;
pub mod text;

pub use generator::SuggestionGenerator;
pub use scorer::{ScoreBreakdown, SimilarityScorer};

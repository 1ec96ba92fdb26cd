//! Stage acceptance.

pub mod gate;

pub use gate::{MeanScoring, MinScoring, QualityConfig, QualityGate, ScoringPolicy};

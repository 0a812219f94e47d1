pub mod calculator;
pub mod confidence;
pub mod guardrails;

pub use calculator::{PriceCalculation, RiskFactors};
pub use confidence::ConfidenceFactors;
pub use guardrails::AnchorDecision;

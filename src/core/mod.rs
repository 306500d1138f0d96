//! Core functionality for the abuse defense engine.
//!
//! This module contains the detection and defense components:
//! windowed per-IP counters, the attack pattern classifier, the
//! anomaly detector, the reputation scorer, the defense controller,
//! and the ingest gate tying them together.

pub mod anomaly;
pub mod counters;
pub mod defense;
pub mod gate;
pub mod patterns;
pub mod reputation;

pub use anomaly::{AnomalyDetector, AnomalyResult};
pub use counters::{TrafficSnapshot, WindowedCounters};
pub use defense::DefenseController;
pub use gate::{spawn_sweeper, IngestGate};
pub use patterns::PatternMatch;
pub use reputation::ReputationScorer;

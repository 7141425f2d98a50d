//! Core data model.
//!
//! Jobs flow through the broker; activity signals and work sessions are read
//! from collaborators; score records are the append-only audit output.

pub mod activity;
pub mod job;
pub mod score;

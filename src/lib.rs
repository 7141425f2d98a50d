//! # pulse-rs
//!
//! Periodic fan-out pipeline that decides whether each user is actively
//! working and records an explainable, append-only score.
//!
//! A [`scheduler::Scheduler`] registers a repeatable fan-out job on a
//! [`broker::Broker`]; a [`worker::Worker`] turns each fan-out into one
//! independent job per user and runs the [`scoring::ScoringEngine`] for each.

pub mod broker;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod scheduler;
pub mod scoring;
pub mod store;
pub mod telemetry;
pub mod worker;

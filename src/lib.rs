//! # labrelay
//!
//! Durable report pipeline for lab reports: a producer turns incoming
//! messages into jobs, a SQLite-backed job store hands them out one at a
//! time, and a worker brands each report (cover page, header band, page
//! selection) before delivering it to one or more sinks.
//!
//! The composition engine is also usable on its own, for example through
//! [`compose::batch::process_folder`].

pub mod clock;
pub mod compose;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod model;
pub mod process;
pub mod producer;
pub mod sink;
pub mod telemetry;

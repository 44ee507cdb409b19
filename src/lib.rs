//! Distributed content-addressed file storage coordinator.
//!
//! This crate is organized the way the binary target composes it: `config`
//! for environment-driven settings, `db` for the metadata store, `storage`
//! for the placement/upload/download/health/reconciliation components, and
//! `control` for the small administrative surface tying them together.

pub mod config;
pub mod control;
pub mod db;
pub mod error;
pub mod storage;

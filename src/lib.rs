//! Loan CRM core library
//!
//! Lead distribution, appointment booking with timeslot capacity, and the
//! status rules around them, served over HTTP by the `loan-crm` binary.
//!
//! # Modules
//!
//! - `api`: HTTP handlers.
//! - `core`: Business logic (capacity, scheduling, assignment, status rules).
//! - `data`: Database access and persisted models.
//! - `integrations`: Dialer and webhook clients.
//! - `obs`: Tracing setup.
//! - `config`: Configuration management.
//! - `errors`: Error handling types.

pub mod api;
pub mod core;
pub mod data;
pub mod integrations;
pub mod obs;

// Re-export primary modules for shared use in tests and other binaries
pub mod assignment;
pub mod assignment_storage;
pub mod audit;
pub mod calendar;
pub mod capacity;
pub mod circuit_breaker;
pub mod config;
pub mod cron_handler;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod playbook_client;
pub mod playbook_handler;
pub mod playbook_sync;
pub mod scheduler;
pub mod status_rules;
pub mod status_service;
pub mod webhook_client;

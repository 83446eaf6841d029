//! # Tableau Provider
//!
//! Implements `SourceInventory` for the Tableau Server REST API.
//!
//! ## Overview
//!
//! This module provides:
//! - Paginated listing of sites, projects, users and workbooks
//! - Project hierarchy resolution into slash-separated paths
//! - Streaming workbook downloads with or without embedded extracts
//!
//! Authentication is out of scope: the connector is handed a session token
//! (`X-Tableau-Auth`) issued elsewhere.

pub mod connector;
pub mod error;
pub mod types;

pub use connector::TableauConnector;
pub use error::{Result, TableauError};

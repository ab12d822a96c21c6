//! Shared building blocks for rdmap: record and request types, the error
//! taxonomy, capability traits, layered configuration, vector helpers and
//! corpus preparation from per-center JSON files.

#![deny(warnings)]
#![deny(dead_code)]
#![deny(unused_variables)]
#![deny(unused_imports)]

pub mod config;
pub mod corpus;
pub mod error;
pub mod traits;
pub mod types;
pub mod vector;

pub use error::{Error, Result};

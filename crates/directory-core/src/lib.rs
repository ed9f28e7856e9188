//! # directory-core
//!
//! Core types shared by directory clients: the error taxonomy used by the retry layer,
//! serializable client settings, and security identifiers.
//!
//! ## Modules
//!
//! - [`error`] - Error types and the transient/fatal split
//! - [`config`] - Validated client settings and identity/context kinds
//! - [`sid`] - Security identifier parsing in binary and string form

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod sid;

// Re-export commonly used types
pub use config::{ContextType, DirectorySettings, IdentityType, SaslMechanism};
pub use error::{Error, Result};
pub use sid::SecurityIdentifier;

//! # Kairos Core
//!
//! Core library for the Kairos just-in-time group-access service.
//!
//! This crate provides:
//! - Hierarchical policy model (environment, system, JIT group) with
//!   inherited ACLs and constraints
//! - Policy analysis combining ACL decisions, constraint checks, and
//!   user-supplied inputs
//! - The join-operation lifecycle (self-approve, delegate, approve)
//! - Idempotent provisioning of groups and IAM bindings with
//!   checksum-based reconciliation
//! - Subject resolution with bounded-parallel IdP fan-out
//! - The signed deferral-token protocol
//!
//! ## Example
//!
//! ```rust,no_run
//! use kairos_core::catalog::Catalog;
//! use kairos_core::config::AppConfig;
//! use kairos_core::environment::EnvironmentLoader;
//! use kairos_core::policy::JitGroupId;
//!
//! # async fn example(
//! #     loader: std::sync::Arc<EnvironmentLoader>,
//! #     subject: std::sync::Arc<kairos_core::principal::Subject>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::from_env()?;
//! let catalog = Catalog::new(loader, subject);
//!
//! let group = catalog.group(&"env-1.sys-1.admins".parse::<JitGroupId>()?).await?;
//! let join = group.request_to_join().await?;
//! join.set_input("expiry", "3600")?;
//! let membership = join.execute().await?;
//! println!("member until {}", membership.expiry);
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod catalog;
pub mod clients;
pub mod config;
pub mod constraint;
pub mod context;
pub mod deferral;
pub mod environment;
pub mod errors;
pub mod join;
pub mod policy;
pub mod principal;
pub mod provision;
pub mod subject;

pub use errors::{KairosError, Result};

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! # Policy model
//!
//! The hierarchical policy tree (environment, system, JIT group) with
//! inherited ACLs and constraints.
//!
//! This module provides:
//! - `PolicyPermission`: bitmask of the permission vocabulary
//! - `AccessControlList` / `AclEntry`: ordered allow/deny evaluation
//! - `JitGroupId`: canonical `env.system.name` identifiers
//! - `EnvironmentPolicy` / `SystemPolicy` / `JitGroupPolicy`: the tree
//! - `Privilege`: what a membership confers, with stable checksums
//! - `PolicyDocument`: the YAML document format

mod acl;
mod document;
mod id;
mod permission;
mod privilege;
mod tree;

pub use acl::{AccessControlList, AclEntry};
pub use document::{IssueSeverity, PolicyDocument, ValidationIssue, SCHEMA_VERSION};
pub use id::JitGroupId;
pub use permission::PolicyPermission;
pub use privilege::{bindings_checksum, BindingCondition, IamRoleBinding, Privilege, ResourceRef};
pub use tree::{
    ConstraintMap, EnvironmentPolicy, JitGroupPolicy, PolicyMetadata, SystemPolicy,
    MAX_COMPONENT_NAME_LEN, MAX_ENVIRONMENT_NAME_LEN,
};

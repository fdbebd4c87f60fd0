//! Core types for vsmerger.
//!
//! - **Identities**: [`ObjectKey`] and [`TargetRef`] with namespace defaulting
//! - **Data model**: [`Specification`] (a contributed fragment) and
//!   [`TargetResource`] (the shared object fragments are merged into)
//! - **Manifests**: multi-document YAML loading for the local cluster
//! - **Errors**: [`Error`] and the [`Result`] alias

#![forbid(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod error;
pub mod manifest;
pub mod result;
pub mod types;

pub use error::Error;
pub use manifest::{load_manifest_file, parse_manifests, Manifest, MERGE_KIND, TARGET_KIND};
pub use result::{Result, ResultExt};
pub use types::{
    MergeSpec, MergeStatus, ObjectKey, ObjectMeta, Payload, Specification, TargetRef,
    TargetResource,
};

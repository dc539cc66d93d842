//! Filesystem-backed object storage namespace.
//!
//! Projects an S3-like namespace (buckets, keys, versions, multipart
//! uploads) onto an ordinary POSIX directory tree: one root directory per
//! bucket, object bytes in regular files, object metadata in `user.*`
//! extended attributes, prior versions in `.versions/` sidecar directories.

#[macro_use]
extern crate tracing;

pub mod copy;
pub mod delete;
pub mod get;
pub mod list;
pub mod multipart;
pub mod object;
pub mod put;
pub mod store;
pub mod versioning;

pub use object::*;
pub use store::{ReqCtx, Store, StoreParams, StoreShared};

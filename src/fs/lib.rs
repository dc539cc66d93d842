//! Filesystem primitives of the NSFS object store: path mapping, xattr
//! metadata, identity-checked link/unlink, directory caches and the shared
//! buffer pool

#[macro_use]
extern crate tracing;

pub mod buffer_pool;
pub mod dir_cache;
pub mod ident;
pub mod md;
pub mod path;
pub mod safe_ops;

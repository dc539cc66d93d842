//! Data model of the store surface: parameter and result types of the
//! object operations

use std::pin::Pin;

use bytes::Bytes;
use futures::stream::Stream;

use nsfs_fs::ident::VersionId;
use nsfs_fs::md::XattrMap;
use nsfs_util::error::Error;

/// Versioning mode of a bucket
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersioningMode {
	Disabled,
	Suspended,
	Enabled,
}

impl VersioningMode {
	pub fn is_disabled(self) -> bool {
		self == VersioningMode::Disabled
	}

	pub fn is_suspended(self) -> bool {
		self == VersioningMode::Suspended
	}

	pub fn is_enabled(self) -> bool {
		self == VersioningMode::Enabled
	}
}

/// Access mode of a bucket
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
	ReadWrite,
	ReadOnly,
}

/// Backend the bucket directory lives on. The GPFS tag selects the
/// atomic-temp publish mode of the upload pipeline; without the native
/// library both arms execute the POSIX sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
	Posix,
	Gpfs,
}

/// Byte source of an upload
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// Information about one object or version, as returned by reads and
/// listings
#[derive(Clone, Debug)]
pub struct ObjectInfo {
	pub key: String,
	pub version_id: Option<VersionId>,
	pub etag: String,
	pub size: u64,
	/// Last modification, milliseconds since the epoch
	pub create_time_ms: u64,
	pub content_type: Option<String>,
	/// Public user metadata, internal keys already stripped
	pub xattr: XattrMap,
	pub delete_marker: bool,
	pub is_latest: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ListParams {
	pub prefix: String,
	/// Only `""` and `"/"` are accepted
	pub delimiter: String,
	pub key_marker: String,
	pub version_id_marker: Option<String>,
	/// Capped at 1000
	pub limit: Option<usize>,
}

#[derive(Debug, Default)]
pub struct ListResult {
	pub objects: Vec<ObjectInfo>,
	pub common_prefixes: Vec<String>,
	pub is_truncated: bool,
	pub next_marker: Option<String>,
	pub next_version_id_marker: Option<String>,
}

/// Server-side copy request embedded in an upload
#[derive(Clone, Debug)]
pub struct CopySource {
	/// Key in the same bucket to copy from
	pub key: String,
	/// Copy the source's metadata instead of the request's
	pub copy_xattr: bool,
}

/// How a server-side copy was satisfied
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyStatus {
	/// Destination already resolves to the source inode, nothing to do
	SameInode,
	/// Hard link into place, no bytes streamed
	Linked,
	/// Byte-by-byte streaming copy
	Fallback,
}

#[derive(Debug)]
pub struct UploadParams {
	pub key: String,
	pub content_type: Option<String>,
	/// Client-declared content md5, base64 as sent on the wire; a mismatch
	/// with the computed digest fails the upload
	pub content_md5_b64: Option<String>,
	/// Declared size; required to recognize the empty directory object fast
	/// path
	pub size: Option<u64>,
	/// Public user metadata
	pub xattr: XattrMap,
	pub copy_source: Option<CopySource>,
	/// Requested server-side encryption algorithm; unsupported
	pub encryption: Option<String>,
}

impl Default for UploadParams {
	fn default() -> Self {
		Self {
			key: String::new(),
			content_type: None,
			content_md5_b64: None,
			size: None,
			xattr: XattrMap::new(),
			copy_source: None,
			encryption: None,
		}
	}
}

#[derive(Clone, Debug)]
pub struct UploadResult {
	pub etag: String,
	pub version_id: Option<VersionId>,
	pub copy_status: Option<CopyStatus>,
	pub size: u64,
}

#[derive(Clone, Debug, Default)]
pub struct DeleteParams {
	pub key: String,
	pub version_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct DeleteResult {
	/// Version id of a delete marker created by this deletion
	pub created_delete_marker: Option<VersionId>,
	/// Whether the removed version was itself a delete marker
	pub deleted_delete_marker: bool,
}

/// Per-key outcome of a batch deletion
#[derive(Debug)]
pub struct DeletedObject {
	pub key: String,
	pub result: Result<DeleteResult, Error>,
}

/// One uploaded part of a multipart upload
#[derive(Clone, Debug)]
pub struct MultipartInfo {
	pub num: u32,
	pub size: u64,
	pub etag: String,
	pub last_modified_ms: u64,
}

/// One part reference in a completion request
#[derive(Clone, Debug)]
pub struct CompletePart {
	pub num: u32,
	pub etag: String,
}

/// Result of `list_uploads`; always empty
#[derive(Debug, Default)]
pub struct ListUploadsResult {
	pub uploads: Vec<ObjectInfo>,
	pub is_truncated: bool,
}

//! Server-side copy: same-inode detection and hard-link reuse before
//! falling back to a streaming copy of the source bytes

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use futures::TryStreamExt;
use tokio_util::io::ReaderStream;

use nsfs_fs::ident::VersionId;
use nsfs_fs::md::{self, XattrMap};
use nsfs_util::error::Error;

use crate::get::etag_of;
use crate::object::{ByteStream, CopySource};
use crate::store::Store;

/// Metadata carried over from the copy source
pub(crate) struct SourceMd {
	pub xattr_public: XattrMap,
	pub content_type: Option<String>,
	pub content_md5: Option<String>,
}

/// Outcome of the copy preparation step
pub(crate) enum CopyPrep {
	/// Destination already resolves to the source inode; nothing to do
	SameInode {
		etag: String,
		version_id: Option<VersionId>,
		size: u64,
	},
	/// The source was hard-linked into the staging path; no bytes move
	Linked { md: Option<SourceMd> },
	/// Stream the source bytes through the regular pipeline
	Stream {
		stream: ByteStream,
		md: Option<SourceMd>,
	},
}

pub(crate) async fn prepare_copy(
	store: &Store,
	source: &CopySource,
	dest_path: &Path,
	staging: &Path,
) -> Result<CopyPrep, Error> {
	if source.key.ends_with('/') {
		return Err(Error::bad_request(
			"copy of a directory object is not supported",
		));
	}
	let mapper = store.mapper();
	let src_path = mapper.file_path(&source.key)?;
	mapper.check_in_bucket(&src_path).await?;

	let src_meta = tokio::fs::metadata(&src_path)
		.await
		.map_err(Error::for_object)?;
	let src_xattrs = md::get_all(&src_path).await.map_err(Error::for_object)?;
	if src_xattrs
		.get(md::XATTR_DELETE_MARKER)
		.map(|v| v == "true")
		.unwrap_or(false)
	{
		return Err(Error::NoSuchObject);
	}

	let source_md = if source.copy_xattr {
		Some(SourceMd {
			xattr_public: md::to_public(&src_xattrs),
			content_type: src_xattrs.get(md::XATTR_CONTENT_TYPE).cloned(),
			content_md5: src_xattrs.get(md::XATTR_CONTENT_MD5).cloned(),
		})
	} else {
		None
	};

	// the shortcuts below share the source inode, so they only apply when
	// the destination keeps the source's metadata as well
	if source.copy_xattr {
		// copy onto itself: the destination already is the source inode
		if let Ok(dst_meta) = tokio::fs::metadata(dest_path).await {
			if dst_meta.dev() == src_meta.dev() && dst_meta.ino() == src_meta.ino() {
				let version_id = src_xattrs
					.get(md::XATTR_VERSION_ID)
					.and_then(|s| s.parse().ok());
				return Ok(CopyPrep::SameInode {
					etag: etag_of(&src_xattrs, &src_meta),
					version_id,
					size: src_meta.len(),
				});
			}
		}

		// hard-link reuse needs the published file to keep the source
		// inode, which version displacement would break
		if store.versioning().is_disabled() {
			match tokio::fs::hard_link(&src_path, staging).await {
				Ok(()) => return Ok(CopyPrep::Linked { md: source_md }),
				Err(e) => {
					debug!("copy of {} falls back to streaming: {}", source.key, e);
				}
			}
		}
	}

	let file = tokio::fs::File::open(&src_path)
		.await
		.map_err(Error::for_object)?;
	let stream: ByteStream =
		Box::pin(ReaderStream::with_capacity(file, 64 * 1024).map_err(Error::Io));
	Ok(CopyPrep::Stream {
		stream,
		md: source_md,
	})
}

//! Upload pipeline: streamed writes into a staging file with an optional
//! incremental md5, xattr commit, and atomic publish through the version
//! manager

use std::path::{Path, PathBuf};

use base64::prelude::*;
use bytes::{Bytes, BytesMut};
use futures::stream::Stream;
use futures::StreamExt;
use md5::{Digest as Md5Digest, Md5};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use nsfs_fs::ident::VersionId;
use nsfs_fs::md::{self, XattrMap};
use nsfs_fs::safe_ops;
use nsfs_util::error::Error;

use crate::copy;
use crate::object::{ByteStream, CopyStatus, UploadParams, UploadResult, VersioningMode};
use crate::store::{ReqCtx, Store};
use crate::versioning;

pub async fn upload_object(
	store: &Store,
	ctx: &ReqCtx,
	params: UploadParams,
	source: Option<ByteStream>,
) -> Result<UploadResult, Error> {
	store.require_writable()?;
	let started = std::time::Instant::now();
	let res = upload_object_inner(store, ctx, params, source).await;
	ctx.observe("upload_object", started, res.is_ok());
	res
}

async fn upload_object_inner(
	store: &Store,
	ctx: &ReqCtx,
	params: UploadParams,
	mut source: Option<ByteStream>,
) -> Result<UploadResult, Error> {
	if params.encryption.is_some() {
		return Err(Error::EncryptionUnsupported);
	}
	let key = params.key.clone();
	let mapper = store.mapper();
	let file_path = mapper.file_path(&key)?;
	mapper.check_in_bucket(&file_path).await?;

	// empty directory object: no bytes, metadata on the directory itself
	if key.ends_with('/') && params.size.unwrap_or(0) == 0 && params.copy_source.is_none() {
		return upload_empty_dir_object(store, &key, &params).await;
	}

	// one pool slot bounds this upload's share of IO memory
	let _slot = store.shared().buf_pool.reserve().await?;

	safe_ops::create_dirs_idempotent(&mapper.uploads_dir(), store.dir_mode()).await?;
	let staging = mapper.new_staging_path();
	let mut cleanup = StagingCleanup::new(staging.clone(), ctx.cancel.clone());

	let mut copy_status: Option<CopyStatus> = None;
	let mut xattr_public = params.xattr.clone();
	let mut content_type = params.content_type.clone();
	let mut md5sum: Option<String> = None;

	if let Some(cs) = &params.copy_source {
		match copy::prepare_copy(store, cs, &file_path, &staging).await? {
			copy::CopyPrep::SameInode {
				etag,
				version_id,
				size,
			} => {
				cleanup.cancel();
				return Ok(UploadResult {
					etag,
					version_id,
					copy_status: Some(CopyStatus::SameInode),
					size,
				});
			}
			copy::CopyPrep::Linked { md } => {
				copy_status = Some(CopyStatus::Linked);
				if let Some(md) = md {
					xattr_public = md.xattr_public;
					content_type = md.content_type;
					md5sum = md.content_md5;
				}
			}
			copy::CopyPrep::Stream { stream, md } => {
				copy_status = Some(CopyStatus::Fallback);
				source = Some(stream);
				if let Some(md) = md {
					xattr_public = md.xattr_public;
					content_type = md.content_type;
				}
			}
		}
	}

	let want_md5 = store.config().calculate_md5
		|| store.force_md5()
		|| params.content_md5_b64.is_some();

	let mut size;
	if copy_status == Some(CopyStatus::Linked) {
		size = 0; // set from the linked file's stat below
	} else {
		let stream = source.ok_or_else(|| Error::bad_request("upload requires a byte stream"))?;
		let (written, digest) = write_stream_to_file(store, ctx, stream, &staging, want_md5).await?;
		size = written;
		if let Some(digest) = digest {
			if let Some(b64) = &params.content_md5_b64 {
				let declared = BASE64_STANDARD
					.decode(b64)
					.map_err(|_| Error::bad_request("invalid content-md5 header"))?;
				if declared != digest {
					return Err(Error::bad_request("content-md5 mismatch"));
				}
			}
			md5sum = Some(hex::encode(digest));
		}
	}

	let meta = tokio::fs::symlink_metadata(&staging)
		.await
		.map_err(Error::Io)?;
	if copy_status == Some(CopyStatus::Linked) {
		size = meta.len();
	}

	let (version_id, prev_version_id) = version_identity(store, &key, &meta).await?;

	let mut xattrs = md::to_storage(&xattr_public);
	if let Some(ct) = &content_type {
		xattrs.insert(md::XATTR_CONTENT_TYPE.to_string(), ct.clone());
	}
	if let Some(m) = &md5sum {
		xattrs.insert(md::XATTR_CONTENT_MD5.to_string(), m.clone());
	}
	if let Some(v) = &version_id {
		xattrs.insert(md::XATTR_VERSION_ID.to_string(), v.to_string());
	}
	if let Some(p) = &prev_version_id {
		xattrs.insert(md::XATTR_PREV_VERSION_ID.to_string(), p.to_string());
	}

	let etag = match &md5sum {
		Some(m) => m.clone(),
		None => VersionId::of(&meta).to_string(),
	};

	if key.ends_with('/') {
		publish_dir_object(store, &staging, &key, xattrs, size).await?;
	} else {
		md::set_all(&staging, &xattrs).await.map_err(Error::Io)?;
		versioning::publish_staged(store, &staging, &key).await?;
		if store.config().trigger_fsync {
			fsync_parent_dir(&file_path).await?;
		}
	}

	cleanup.cancel();
	Ok(UploadResult {
		etag,
		version_id,
		copy_status,
		size,
	})
}

async fn upload_empty_dir_object(
	store: &Store,
	key: &str,
	params: &UploadParams,
) -> Result<UploadResult, Error> {
	let mapper = store.mapper();
	let dir_path = mapper.md_path(key)?;
	safe_ops::create_dirs_idempotent(&dir_path, store.dir_mode()).await?;

	let mut xattrs = md::to_storage(&params.xattr);
	if let Some(ct) = &params.content_type {
		xattrs.insert(md::XATTR_CONTENT_TYPE.to_string(), ct.clone());
	}
	xattrs.insert(md::XATTR_DIR_CONTENT.to_string(), "0".to_string());
	md::replace_all_user(&dir_path, &xattrs)
		.await
		.map_err(Error::Io)?;

	// a zero-size directory object carries no folder sentinel
	match tokio::fs::remove_file(mapper.file_path(key)?).await {
		Ok(()) => (),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
		Err(e) => return Err(Error::Io(e)),
	}

	let meta = tokio::fs::symlink_metadata(&dir_path)
		.await
		.map_err(Error::Io)?;
	Ok(UploadResult {
		etag: VersionId::of(&meta).to_string(),
		version_id: None,
		copy_status: None,
		size: 0,
	})
}

/// Publish a staged body as a directory object: the bytes become the folder
/// sentinel, the metadata goes onto the directory with the body size
/// recorded as `dir_content`
pub(crate) async fn publish_dir_object(
	store: &Store,
	staging: &Path,
	key: &str,
	xattrs: XattrMap,
	size: u64,
) -> Result<(), Error> {
	let mapper = store.mapper();
	let dir_path = mapper.md_path(key)?;
	let folder_path = mapper.file_path(key)?;
	safe_ops::create_dirs_idempotent(&dir_path, store.dir_mode()).await?;

	let mut dir_xattrs = xattrs;
	dir_xattrs.insert(md::XATTR_DIR_CONTENT.to_string(), size.to_string());
	md::replace_all_user(&dir_path, &dir_xattrs)
		.await
		.map_err(Error::Io)?;

	tokio::fs::rename(staging, &folder_path)
		.await
		.map_err(Error::Io)?;

	// re-apply the content size after the move
	let mut content = XattrMap::new();
	content.insert(md::XATTR_DIR_CONTENT.to_string(), size.to_string());
	md::set_all(&dir_path, &content).await.map_err(Error::Io)?;
	Ok(())
}

/// Version identity of a staged write: the staging file's own stat id in
/// enabled mode, `null` while suspended, nothing when versioning is off.
/// Directory objects are never versioned.
pub(crate) async fn version_identity(
	store: &Store,
	key: &str,
	staged_meta: &std::fs::Metadata,
) -> Result<(Option<VersionId>, Option<VersionId>), Error> {
	match store.versioning() {
		VersioningMode::Disabled => Ok((None, None)),
		mode => {
			if key.ends_with('/') {
				return Ok((None, None));
			}
			let latest_path = store.mapper().file_path(key)?;
			let prev = versioning::read_version_info(&latest_path)
				.await?
				.map(|v| v.version_id);
			let vid = if mode.is_enabled() {
				VersionId::of(staged_meta)
			} else {
				VersionId::Null
			};
			Ok((Some(vid), prev))
		}
	}
}

/// Stream a byte source into a freshly created file, computing an
/// incremental md5 when requested. Cancellation is honored before and after
/// every awaited IO.
pub(crate) async fn write_stream_to_file(
	store: &Store,
	ctx: &ReqCtx,
	stream: ByteStream,
	path: &Path,
	want_md5: bool,
) -> Result<(u64, Option<[u8; 16]>), Error> {
	let mut chunker = StreamChunker::new(stream, store.config().buf_size);
	let mut file = tokio::fs::OpenOptions::new()
		.write(true)
		.create_new(true)
		.mode(store.file_mode())
		.open(path)
		.await
		.map_err(Error::Io)?;
	let mut hasher = if want_md5 { Some(Md5::new()) } else { None };
	let mut total = 0u64;
	loop {
		ctx.check_cancelled()?;
		let chunk = match chunker.next().await? {
			Some(c) => c,
			None => break,
		};
		if let Some(h) = hasher.as_mut() {
			h.update(&chunk);
		}
		file.write_all(&chunk).await.map_err(Error::Io)?;
		ctx.check_cancelled()?;
		total += chunk.len() as u64;
	}
	file.flush().await.map_err(Error::Io)?;
	if store.config().trigger_fsync {
		file.sync_all().await.map_err(Error::Io)?;
	}
	drop(file);
	Ok((total, hasher.map(|h| h.finalize().into())))
}

/// Fsync the directory containing `path` so a completed rename is
/// persisted
pub(crate) async fn fsync_parent_dir(path: &Path) -> Result<(), Error> {
	if let Some(parent) = path.parent() {
		let dir = tokio::fs::OpenOptions::new()
			.read(true)
			.open(parent)
			.await
			.map_err(Error::Io)?;
		dir.sync_all().await.map_err(Error::Io)?;
	}
	Ok(())
}

/// Re-chunk an incoming byte stream into pieces of at most `chunk_size`
pub(crate) struct StreamChunker<S: Stream<Item = Result<Bytes, Error>>> {
	stream: S,
	read_all: bool,
	chunk_size: usize,
	buf: BytesMut,
}

impl<S: Stream<Item = Result<Bytes, Error>> + Unpin> StreamChunker<S> {
	pub(crate) fn new(stream: S, chunk_size: usize) -> Self {
		Self {
			stream,
			read_all: false,
			chunk_size,
			buf: BytesMut::new(),
		}
	}

	pub(crate) async fn next(&mut self) -> Result<Option<Bytes>, Error> {
		while !self.read_all && self.buf.len() < self.chunk_size {
			if let Some(block) = self.stream.next().await {
				let bytes = block?;
				trace!("body next: {} bytes", bytes.len());
				self.buf.extend_from_slice(&bytes);
			} else {
				self.read_all = true;
			}
		}
		if self.buf.is_empty() {
			Ok(None)
		} else {
			let take = std::cmp::min(self.buf.len(), self.chunk_size);
			Ok(Some(self.buf.split_to(take).freeze()))
		}
	}
}

/// Removes the staging file if the upload did not run to completion.
/// Cancelled uploads leave their staging file behind for later cleanup.
struct StagingCleanup(Option<StagingCleanupInner>);

struct StagingCleanupInner {
	staging: PathBuf,
	cancel: CancellationToken,
}

impl StagingCleanup {
	fn new(staging: PathBuf, cancel: CancellationToken) -> Self {
		Self(Some(StagingCleanupInner { staging, cancel }))
	}

	fn cancel(&mut self) {
		drop(self.0.take());
	}
}

impl Drop for StagingCleanup {
	fn drop(&mut self) {
		if let Some(inner) = self.0.take() {
			if inner.cancel.is_cancelled() {
				return;
			}
			tokio::spawn(async move {
				if let Err(e) = tokio::fs::remove_file(&inner.staging).await {
					if e.kind() != std::io::ErrorKind::NotFound {
						warn!(
							"cannot clean up staging file {}: {}",
							inner.staging.display(),
							e
						);
					}
				}
			});
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use futures::stream;

	fn byte_stream(chunks: Vec<Vec<u8>>) -> ByteStream {
		Box::pin(stream::iter(
			chunks.into_iter().map(|c| Ok(Bytes::from(c))),
		))
	}

	#[tokio::test]
	async fn chunker_rechunks() {
		let stream = byte_stream(vec![vec![1u8; 3], vec![2u8; 5], vec![3u8; 2]]);
		let mut chunker = StreamChunker::new(stream, 4);
		let mut sizes = vec![];
		while let Some(chunk) = chunker.next().await.unwrap() {
			sizes.push(chunk.len());
		}
		assert_eq!(sizes.iter().sum::<usize>(), 10);
		assert!(sizes[..sizes.len() - 1].iter().all(|s| *s == 4));
	}

	#[tokio::test]
	async fn chunker_empty_stream() {
		let stream = byte_stream(vec![]);
		let mut chunker = StreamChunker::new(stream, 4);
		assert!(chunker.next().await.unwrap().is_none());
	}
}

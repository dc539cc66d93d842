//! Read path: metadata reads and range streaming through the shared buffer
//! pool

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use nsfs_fs::ident::{mtime_ns_of, VersionId};
use nsfs_fs::md::{self, XattrMap};
use nsfs_util::error::Error;

use crate::object::ObjectInfo;
use crate::store::{ReqCtx, Store};
use crate::versioning;

/// Etag of an object: its stored md5 when one was computed, otherwise the
/// stat-derived version id string (which always contains a dash, so clients
/// never mistake it for a raw md5)
pub(crate) fn etag_of(xattrs: &XattrMap, meta: &std::fs::Metadata) -> String {
	match xattrs.get(md::XATTR_CONTENT_MD5) {
		Some(m) => m.clone(),
		None => VersionId::of(meta).to_string(),
	}
}

pub(crate) fn is_delete_marker(xattrs: &XattrMap) -> bool {
	xattrs
		.get(md::XATTR_DELETE_MARKER)
		.map(|v| v == "true")
		.unwrap_or(false)
}

/// Resolve the path a (key, version) read refers to; the requested version
/// may be the latest itself or a `.versions/` sidecar
pub(crate) async fn resolve_read_path(
	store: &Store,
	key: &str,
	version_id: Option<&VersionId>,
) -> Result<PathBuf, Error> {
	let mapper = store.mapper();
	match version_id {
		None => mapper.file_path(key),
		Some(vid) => {
			let latest_path = mapper.file_path(key)?;
			if let Some(latest) = versioning::read_version_info(&latest_path).await? {
				if latest.version_id == *vid {
					return Ok(latest_path);
				}
			}
			mapper.version_path(key, vid)
		}
	}
}

pub(crate) fn object_info_from(
	store: &Store,
	key: &str,
	meta: &std::fs::Metadata,
	xattrs: &XattrMap,
	explicit_vid: Option<VersionId>,
	is_latest: bool,
) -> ObjectInfo {
	let version_id = explicit_vid
		.or_else(|| xattrs.get(md::XATTR_VERSION_ID).and_then(|s| s.parse().ok()))
		.or_else(|| {
			if store.versioning().is_disabled() {
				None
			} else {
				Some(VersionId::of(meta))
			}
		});
	ObjectInfo {
		key: key.to_string(),
		version_id,
		etag: etag_of(xattrs, meta),
		size: meta.len(),
		create_time_ms: mtime_ns_of(meta) / 1_000_000,
		content_type: xattrs.get(md::XATTR_CONTENT_TYPE).cloned(),
		xattr: md::to_public(xattrs),
		delete_marker: is_delete_marker(xattrs),
		is_latest,
	}
}

pub async fn read_object_md(
	store: &Store,
	ctx: &ReqCtx,
	key: &str,
	version_id: Option<String>,
) -> Result<ObjectInfo, Error> {
	let started = std::time::Instant::now();
	let res = read_object_md_inner(store, key, version_id).await;
	ctx.observe("read_object_md", started, res.is_ok());
	res
}

async fn read_object_md_inner(
	store: &Store,
	key: &str,
	version_id: Option<String>,
) -> Result<ObjectInfo, Error> {
	let vid = version_id.map(|s| s.parse::<VersionId>()).transpose()?;
	let mapper = store.mapper();

	if key.ends_with('/') {
		let dir_path = mapper.md_path(key)?;
		mapper.check_in_bucket(&dir_path).await?;
		let meta = tokio::fs::metadata(&dir_path)
			.await
			.map_err(Error::for_object)?;
		let xattrs = md::get_all(&dir_path).await.map_err(Error::for_object)?;
		let size: u64 = match xattrs.get(md::XATTR_DIR_CONTENT) {
			Some(v) => v.parse().unwrap_or(0),
			// a directory without the content marker is not an object
			None => return Err(Error::NoSuchObject),
		};
		let mut info = object_info_from(store, key, &meta, &xattrs, None, true);
		info.size = size;
		info.version_id = None;
		return Ok(info);
	}

	let path = resolve_read_path(store, key, vid.as_ref()).await?;
	mapper.check_in_bucket(&path).await?;
	let meta = tokio::fs::metadata(&path).await.map_err(Error::for_object)?;
	if meta.is_dir() {
		return Err(Error::NoSuchObject);
	}
	let xattrs = md::get_all(&path).await.map_err(Error::for_object)?;
	if is_delete_marker(&xattrs) {
		return Err(Error::NoSuchObject);
	}
	Ok(object_info_from(
		store,
		key,
		&meta,
		&xattrs,
		vid,
		vid.is_none(),
	))
}

#[derive(Clone, Debug, Default)]
pub struct ReadParams {
	pub key: String,
	pub version_id: Option<String>,
	pub start: Option<u64>,
	pub end: Option<u64>,
}

/// Output sink of a streamed read. `write` returning `false` signals
/// backpressure; the reader awaits `drain` before the next chunk.
#[async_trait]
pub trait ObjectSink: Send {
	async fn write(&mut self, chunk: &[u8]) -> Result<bool, Error>;
	async fn drain(&mut self) -> Result<(), Error>;
	async fn finish(&mut self) -> Result<(), Error>;
}

/// Sink collecting everything in memory; convenient for embedders that
/// want whole bodies and for tests
#[derive(Default)]
pub struct CollectSink {
	pub data: Vec<u8>,
	pub finished: bool,
}

#[async_trait]
impl ObjectSink for CollectSink {
	async fn write(&mut self, chunk: &[u8]) -> Result<bool, Error> {
		self.data.extend_from_slice(chunk);
		Ok(true)
	}

	async fn drain(&mut self) -> Result<(), Error> {
		Ok(())
	}

	async fn finish(&mut self) -> Result<(), Error> {
		self.finished = true;
		Ok(())
	}
}

/// Stream a byte range of an object into `sink`. Returns the number of
/// bytes written. Ranges beyond the object size produce an empty,
/// successful stream.
pub async fn read_object_stream(
	store: &Store,
	ctx: &ReqCtx,
	params: &ReadParams,
	sink: &mut dyn ObjectSink,
) -> Result<u64, Error> {
	let started = std::time::Instant::now();
	let res = read_object_stream_inner(store, ctx, params, sink).await;
	ctx.observe("read_object_stream", started, res.is_ok());
	res
}

async fn read_object_stream_inner(
	store: &Store,
	ctx: &ReqCtx,
	params: &ReadParams,
	sink: &mut dyn ObjectSink,
) -> Result<u64, Error> {
	use std::os::unix::fs::MetadataExt;

	let vid = params
		.version_id
		.as_ref()
		.map(|s| s.parse::<VersionId>())
		.transpose()?;
	let mapper = store.mapper();

	let path = if params.key.ends_with('/') {
		let dir_path = mapper.md_path(&params.key)?;
		mapper.check_in_bucket(&dir_path).await?;
		match md::get_one(&dir_path, md::XATTR_DIR_CONTENT)
			.await
			.map_err(Error::for_object)?
		{
			None => return Err(Error::NoSuchObject),
			Some(v) if v.parse::<u64>().unwrap_or(0) == 0 => {
				// nothing to open for an empty directory object
				sink.finish().await?;
				return Ok(0);
			}
			Some(_) => mapper.file_path(&params.key)?,
		}
	} else {
		resolve_read_path(store, &params.key, vid.as_ref()).await?
	};
	mapper.check_in_bucket(&path).await?;

	let xattrs = md::get_all(&path).await.map_err(Error::for_object)?;
	if is_delete_marker(&xattrs) {
		return Err(Error::NoSuchObject);
	}

	let mut open_options = tokio::fs::OpenOptions::new();
	open_options.read(true);
	// "rd" requests direct IO, bypassing the page cache
	if store.config().open_read_mode == "rd" {
		open_options.custom_flags(libc::O_DIRECT);
	}
	let mut file = open_options.open(&path).await.map_err(Error::for_object)?;
	let meta = file.metadata().await.map_err(Error::Io)?;
	let size = meta.len();
	let start = params.start.unwrap_or(0);
	let end = params.end.map(|e| e.min(size)).unwrap_or(size);
	if start >= end {
		sink.finish().await?;
		return Ok(0);
	}

	file.seek(SeekFrom::Start(start)).await.map_err(Error::Io)?;
	let mut pos = start;
	let sparse =
		store.config().buf_warmup_sparse_file_reads && meta.blocks() * 512 < size;
	let mut warmed = false;

	while pos < end {
		ctx.check_cancelled()?;
		if sparse && !warmed {
			// a 1 byte read wakes a recalled file without pinning a large
			// pool buffer behind the recall
			let mut warmup = [0u8; 1];
			let n = file.read(&mut warmup).await.map_err(Error::Io)?;
			file.seek(SeekFrom::Start(pos)).await.map_err(Error::Io)?;
			warmed = true;
			ctx.check_cancelled()?;
			if n == 0 {
				break;
			}
		}
		let mut buf = store.shared().buf_pool.acquire().await?;
		let want = std::cmp::min(buf.len() as u64, end - pos) as usize;
		let n = file
			.read(&mut buf.as_mut_slice()[..want])
			.await
			.map_err(Error::Io)?;
		if n == 0 {
			break;
		}
		let writable = sink.write(&buf.as_slice()[..n]).await?;
		if !writable {
			sink.drain().await?;
		}
		drop(buf);
		ctx.check_cancelled()?;
		pos += n as u64;
	}
	sink.finish().await?;
	Ok(pos - start)
}

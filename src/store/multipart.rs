//! Multipart uploads: per-upload scratch directory, part files, and
//! completion by concatenation with an md5-of-md5s etag

use md5::{Digest as Md5Digest, Md5};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use nsfs_fs::ident::mtime_ns_of;
use nsfs_fs::md::{self, XattrMap};
use nsfs_fs::safe_ops;
use nsfs_util::data::gen_id_hex;
use nsfs_util::error::Error;

use crate::object::{
	ByteStream, CompletePart, ListUploadsResult, MultipartInfo, UploadResult,
};
use crate::put;
use crate::store::{ReqCtx, Store};
use crate::versioning;

const CREATE_UPLOAD_FILE: &str = "create_object_upload";
const FINAL_FILE: &str = "final";

fn part_name(num: u32) -> String {
	format!("part-{}", num)
}

fn parse_part_name(name: &str) -> Option<u32> {
	name.strip_prefix("part-")?.parse().ok()
}

/// The original create request, persisted as JSON in the scratch directory
/// so completion can restore the object's metadata
#[derive(Debug, Serialize, Deserialize)]
struct CreateUploadRequest {
	key: String,
	content_type: Option<String>,
	xattr: XattrMap,
}

/// Start a multipart upload: allocate its id and scratch directory and
/// persist the create request
pub async fn create_object_upload(
	store: &Store,
	_ctx: &ReqCtx,
	key: &str,
	content_type: Option<String>,
	xattr: XattrMap,
) -> Result<String, Error> {
	store.require_writable()?;
	store.mapper().validate_key(key)?;

	let obj_id = gen_id_hex();
	let mpu_path = store.mapper().mpu_path(&obj_id);
	safe_ops::create_dirs_idempotent(&mpu_path, store.dir_mode()).await?;

	let request = CreateUploadRequest {
		key: key.to_string(),
		content_type,
		xattr,
	};
	let json = serde_json::to_vec(&request)?;
	tokio::fs::write(mpu_path.join(CREATE_UPLOAD_FILE), &json)
		.await
		.map_err(Error::Io)?;
	debug!("created multipart upload {} for key {}", obj_id, key);
	Ok(obj_id)
}

/// Upload one part. Parts are always digested since completion verifies
/// their etags. Returns the part's etag.
pub async fn upload_multipart(
	store: &Store,
	ctx: &ReqCtx,
	obj_id: &str,
	num: u32,
	source: ByteStream,
) -> Result<String, Error> {
	store.require_writable()?;
	if num == 0 {
		return Err(Error::bad_request("part numbers start at 1"));
	}
	let mpu_path = store.mapper().mpu_path(obj_id);
	tokio::fs::metadata(&mpu_path)
		.await
		.map_err(Error::for_upload)?;

	let _slot = store.shared().buf_pool.reserve().await?;

	// write to a unique name first so a re-upload of the same part number
	// replaces the old bytes atomically
	let tmp_path = mpu_path.join(format!("{}.{}", part_name(num), gen_id_hex()));
	let (size, digest) = put::write_stream_to_file(store, ctx, source, &tmp_path, true).await?;
	let digest = digest.expect("part digests are always computed");
	let etag = hex::encode(digest);

	let mut xattrs = XattrMap::new();
	xattrs.insert(md::XATTR_CONTENT_MD5.to_string(), etag.clone());
	md::set_all(&tmp_path, &xattrs).await.map_err(Error::Io)?;
	tokio::fs::rename(&tmp_path, mpu_path.join(part_name(num)))
		.await
		.map_err(Error::Io)?;

	trace!(
		"upload {} part {}: {} bytes, etag {}",
		obj_id,
		num,
		size,
		etag
	);
	Ok(etag)
}

/// Parts uploaded so far, sorted by part number
pub async fn list_multiparts(store: &Store, obj_id: &str) -> Result<Vec<MultipartInfo>, Error> {
	let mpu_path = store.mapper().mpu_path(obj_id);
	let mut rd = tokio::fs::read_dir(&mpu_path)
		.await
		.map_err(Error::for_upload)?;
	let mut out = Vec::new();
	while let Some(ent) = rd.next_entry().await.map_err(Error::Io)? {
		let name = match ent.file_name().into_string() {
			Ok(n) => n,
			Err(_) => continue,
		};
		let num = match parse_part_name(&name) {
			Some(n) => n,
			None => continue,
		};
		let meta = ent.metadata().await.map_err(Error::Io)?;
		let etag = md::get_one(&mpu_path.join(&name), md::XATTR_CONTENT_MD5)
			.await
			.map_err(Error::Io)?
			.unwrap_or_default();
		out.push(MultipartInfo {
			num,
			size: meta.len(),
			etag,
			last_modified_ms: mtime_ns_of(&meta) / 1_000_000,
		});
	}
	out.sort_by_key(|p| p.num);
	Ok(out)
}

/// Complete the upload: verify every referenced part's etag, concatenate
/// the parts into the final body, compute the md5-of-md5s etag, and publish
/// through the regular pipeline
pub async fn complete_object_upload(
	store: &Store,
	ctx: &ReqCtx,
	obj_id: &str,
	mut parts: Vec<CompletePart>,
) -> Result<UploadResult, Error> {
	store.require_writable()?;
	if parts.is_empty() {
		return Err(Error::bad_request("no parts in completion request"));
	}
	let mpu_path = store.mapper().mpu_path(obj_id);
	let request_json = tokio::fs::read(mpu_path.join(CREATE_UPLOAD_FILE))
		.await
		.map_err(Error::for_upload)?;
	let request: CreateUploadRequest = serde_json::from_slice(&request_json)?;

	parts.sort_by_key(|p| p.num);
	if parts.windows(2).any(|w| w[0].num == w[1].num) {
		return Err(Error::bad_request("duplicate part numbers"));
	}

	let _slot = store.shared().buf_pool.reserve().await?;

	let final_path = mpu_path.join(FINAL_FILE);
	let mut file = tokio::fs::OpenOptions::new()
		.write(true)
		.create(true)
		.truncate(true)
		.mode(store.file_mode())
		.open(&final_path)
		.await
		.map_err(Error::Io)?;

	// the aggregate etag is the md5 over the binary digests of the parts
	let mut aggregate = Md5::new();
	let mut total = 0u64;
	for part in &parts {
		ctx.check_cancelled()?;
		let part_path = mpu_path.join(part_name(part.num));
		let stored_etag = match md::get_one(&part_path, md::XATTR_CONTENT_MD5).await {
			Ok(Some(etag)) => etag,
			Ok(None) => {
				return Err(Error::bad_request(format!(
					"part {} has no stored digest",
					part.num
				)))
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Err(Error::bad_request(format!("part {} was not uploaded", part.num)))
			}
			Err(e) => return Err(Error::Io(e)),
		};
		if part.etag.trim_matches('"') != stored_etag {
			return Err(Error::bad_request(format!(
				"etag mismatch on part {}",
				part.num
			)));
		}
		let binary = hex::decode(&stored_etag)
			.map_err(|_| Error::bad_request(format!("malformed etag on part {}", part.num)))?;
		aggregate.update(&binary);

		let mut part_file = tokio::fs::File::open(&part_path)
			.await
			.map_err(Error::for_upload)?;
		loop {
			ctx.check_cancelled()?;
			let mut buf = store.shared().buf_pool.acquire().await?;
			let n = part_file
				.read(buf.as_mut_slice())
				.await
				.map_err(Error::Io)?;
			if n == 0 {
				break;
			}
			file.write_all(&buf.as_slice()[..n]).await.map_err(Error::Io)?;
			total += n as u64;
		}
	}
	file.flush().await.map_err(Error::Io)?;
	if store.config().trigger_fsync {
		file.sync_all().await.map_err(Error::Io)?;
	}
	drop(file);

	let etag = format!("{}-{}", hex::encode(aggregate.finalize()), parts.len());

	let meta = tokio::fs::symlink_metadata(&final_path)
		.await
		.map_err(Error::Io)?;
	let key = request.key;
	let (version_id, prev_version_id) = put::version_identity(store, &key, &meta).await?;

	let mut xattrs = md::to_storage(&request.xattr);
	if let Some(ct) = &request.content_type {
		xattrs.insert(md::XATTR_CONTENT_TYPE.to_string(), ct.clone());
	}
	xattrs.insert(md::XATTR_CONTENT_MD5.to_string(), etag.clone());
	if let Some(v) = &version_id {
		xattrs.insert(md::XATTR_VERSION_ID.to_string(), v.to_string());
	}
	if let Some(p) = &prev_version_id {
		xattrs.insert(md::XATTR_PREV_VERSION_ID.to_string(), p.to_string());
	}

	if key.ends_with('/') {
		// completion always materializes the folder sentinel, even with
		// zero content bytes
		put::publish_dir_object(store, &final_path, &key, xattrs, total).await?;
	} else {
		md::set_all(&final_path, &xattrs).await.map_err(Error::Io)?;
		versioning::publish_staged(store, &final_path, &key).await?;
		if store.config().trigger_fsync {
			put::fsync_parent_dir(&store.mapper().file_path(&key)?).await?;
		}
	}

	if store.config().remove_parts_on_complete {
		if let Err(e) = tokio::fs::remove_dir_all(&mpu_path).await {
			warn!("cannot remove multipart scratch dir {}: {}", obj_id, e);
		}
	}

	Ok(UploadResult {
		etag,
		version_id,
		copy_status: None,
		size: total,
	})
}

/// Abort the upload and drop its scratch directory
pub async fn abort_object_upload(store: &Store, obj_id: &str) -> Result<(), Error> {
	store.require_writable()?;
	let mpu_path = store.mapper().mpu_path(obj_id);
	tokio::fs::remove_dir_all(&mpu_path)
		.await
		.map_err(Error::for_upload)
}

/// Pending uploads are not tracked per bucket; the listing is always empty
pub async fn list_uploads(_store: &Store) -> Result<ListUploadsResult, Error> {
	Ok(ListUploadsResult::default())
}

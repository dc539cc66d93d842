//! Object deletion: single keys, specific versions, batches, and the
//! directory-object cleanup rules

use std::path::Path;

use nsfs_fs::ident::VersionId;
use nsfs_fs::md;
use nsfs_fs::path::split_key;
use nsfs_fs::safe_ops;
use nsfs_util::error::Error;

use crate::object::{DeleteParams, DeleteResult, DeletedObject, VersioningMode};
use crate::store::{ReqCtx, Store};
use crate::versioning;

pub async fn delete_object(
	store: &Store,
	ctx: &ReqCtx,
	params: DeleteParams,
) -> Result<DeleteResult, Error> {
	store.require_writable()?;
	let started = std::time::Instant::now();
	let res = delete_object_inner(store, &params).await;
	ctx.observe("delete_object", started, res.is_ok());
	res
}

async fn delete_object_inner(store: &Store, params: &DeleteParams) -> Result<DeleteResult, Error> {
	let key = params.key.as_str();
	let mapper = store.mapper();
	let file_path = mapper.file_path(key)?;
	mapper.check_in_bucket(&file_path).await?;

	if key.ends_with('/') {
		return delete_dir_object(store, key).await;
	}

	let version_id = match &params.version_id {
		Some(s) => Some(s.parse::<VersionId>()?),
		None => None,
	};

	match (store.versioning(), version_id) {
		(VersioningMode::Disabled, Some(_)) => {
			// version ids do not exist in a disabled bucket
			Ok(DeleteResult::default())
		}
		(VersioningMode::Disabled, None) => {
			match tokio::fs::remove_file(&file_path).await {
				Ok(()) => remove_empty_parents(store, key).await?,
				// deleting a nonexistent key succeeds quietly
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
				Err(e) => return Err(Error::for_object(e)),
			}
			Ok(DeleteResult::default())
		}
		(mode, None) => delete_latest(store, key, &file_path, mode).await,
		(_, Some(vid)) => delete_version(store, key, &file_path, vid).await,
	}
}

/// Enabled/suspended delete without an explicit version: displace the
/// latest like an overwrite would, then leave a delete marker behind
async fn delete_latest(
	store: &Store,
	key: &str,
	latest_path: &Path,
	mode: VersioningMode,
) -> Result<DeleteResult, Error> {
	let retries = store.config().rename_retries;
	let mut attempt = 0u32;
	loop {
		let res = async {
			let displaced = versioning::displace_latest(store, key, latest_path, mode).await?;
			let prev = displaced.map(|v| v.version_id);
			versioning::create_delete_marker(store, key, prev.as_ref()).await
		}
		.await;
		match res {
			Ok(marker) => {
				return Ok(DeleteResult {
					created_delete_marker: Some(marker),
					deleted_delete_marker: false,
				})
			}
			Err(e) if e.is_retryable_race() && attempt < retries => {
				debug!("delete race on {} (attempt {}): {}", key, attempt, e);
			}
			Err(e) => return Err(e),
		}
		attempt += 1;
	}
}

/// Delete one specific version; promotes a prior version when the deleted
/// one was the latest or a delete marker
async fn delete_version(
	store: &Store,
	key: &str,
	latest_path: &Path,
	vid: VersionId,
) -> Result<DeleteResult, Error> {
	let lost_found = store.mapper().lost_found_dir();
	let retries = store.config().rename_retries;
	let mut attempt = 0u32;
	loop {
		let res: Result<Option<(versioning::VersionInfo, bool)>, Error> = async {
			let latest = versioning::read_version_info(latest_path).await?;
			if let Some(l) = &latest {
				if l.version_id == vid {
					safe_ops::safe_unlink(latest_path, l.id, &lost_found).await?;
					return Ok(Some((l.clone(), true)));
				}
			}
			let vpath = store.mapper().version_path(key, &vid)?;
			match versioning::read_version_info(&vpath).await? {
				Some(v) => {
					safe_ops::safe_unlink(&vpath, v.id, &lost_found).await?;
					// dropping an emptied sidecar dir is best effort
					if let Some(vdir) = vpath.parent() {
						let _ = tokio::fs::remove_dir(vdir).await;
					}
					Ok(Some((v, false)))
				}
				// deleting a nonexistent version succeeds quietly
				None => Ok(None),
			}
		}
		.await;
		match res {
			Ok(Some((deleted, was_latest))) => {
				if was_latest || deleted.delete_marker {
					versioning::promote_prior(store, key, &deleted).await?;
				}
				return Ok(DeleteResult {
					created_delete_marker: None,
					deleted_delete_marker: deleted.delete_marker,
				});
			}
			Ok(None) => return Ok(DeleteResult::default()),
			Err(e) if e.is_retryable_race() && attempt < retries => {
				debug!(
					"versioned delete race on {} {} (attempt {}): {}",
					key, vid, attempt, e
				);
			}
			Err(e) => return Err(e),
		}
		attempt += 1;
	}
}

/// Delete a directory object: remove the folder sentinel, prune empty
/// directories upward, and strip object metadata from a directory that
/// still has children
async fn delete_dir_object(store: &Store, key: &str) -> Result<DeleteResult, Error> {
	let mapper = store.mapper();
	let dir_path = mapper.md_path(key)?;
	let folder_path = mapper.file_path(key)?;

	match tokio::fs::remove_file(&folder_path).await {
		Ok(()) => (),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
		Err(e) => return Err(Error::for_object(e)),
	}

	remove_empty_dirs_upward(store, &dir_path).await?;

	// the directory survived, so it still has children; it just stops
	// being an object
	if tokio::fs::symlink_metadata(&dir_path).await.is_ok() {
		md::clear_all_user(&dir_path).await.map_err(Error::Io)?;
	}
	Ok(DeleteResult::default())
}

/// After deleting a leaf, prune now-empty ancestor directories up to the
/// bucket root
pub(crate) async fn remove_empty_parents(store: &Store, key: &str) -> Result<(), Error> {
	let (dir, _) = split_key(key);
	if dir.is_empty() {
		return Ok(());
	}
	let start = store.mapper().bucket_root().join(dir);
	remove_empty_dirs_upward(store, &start).await
}

async fn remove_empty_dirs_upward(store: &Store, start: &Path) -> Result<(), Error> {
	let root = store.mapper().bucket_root();
	let mut current = start.to_path_buf();
	loop {
		if current == root || !current.starts_with(root) {
			return Ok(());
		}
		match tokio::fs::remove_dir(&current).await {
			Ok(()) => (),
			Err(e) => {
				return match e.raw_os_error() {
					// EEXIST: some systems report a populated dir this way
					Some(libc::ENOTEMPTY)
					| Some(libc::ENOENT)
					| Some(libc::ENOTDIR)
					| Some(libc::EACCES)
					| Some(libc::EEXIST) => Ok(()),
					_ => Err(Error::Io(e)),
				};
			}
		}
		match current.parent() {
			Some(parent) => current = parent.to_path_buf(),
			None => return Ok(()),
		}
	}
}

/// Batch deletion; each key fails or succeeds on its own
pub async fn delete_multiple_objects(
	store: &Store,
	ctx: &ReqCtx,
	objects: Vec<DeleteParams>,
) -> Vec<DeletedObject> {
	let mut out = Vec::with_capacity(objects.len());
	for spec in objects {
		if ctx.check_cancelled().is_err() {
			break;
		}
		let key = spec.key.clone();
		let result = delete_object(store, ctx, spec).await;
		if let Err(e) = &result {
			debug!("batch delete of {} failed: {}", key, e);
		}
		out.push(DeletedObject { key, result });
	}
	out
}

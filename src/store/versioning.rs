//! Version lifecycle: `.versions/` displacement, delete markers and
//! promotion of prior versions.
//!
//! The mode x operation table is encoded here as tagged dispatch; every
//! mutation of the latest path goes through the safe link/unlink
//! primitives so concurrent writers are detected, and the bounded retry
//! loops re-read the on-disk state after every detected race.

use std::path::{Path, PathBuf};

use nsfs_fs::ident::{split_version_name, FileId, VersionId};
use nsfs_fs::md::{self, XattrMap};
use nsfs_fs::path::split_key;
use nsfs_fs::safe_ops;
use nsfs_util::error::Error;

use crate::object::VersioningMode;
use crate::store::Store;

/// Stat + xattr snapshot of one version file
#[derive(Clone, Debug)]
pub(crate) struct VersionInfo {
	pub id: FileId,
	pub version_id: VersionId,
	pub prev_version_id: Option<VersionId>,
	pub delete_marker: bool,
}

/// Read the version info of a path; `None` when nothing is there. A stored
/// version id that does not parse falls back to the stat-derived id.
pub(crate) async fn read_version_info(path: &Path) -> Result<Option<VersionInfo>, Error> {
	let meta = match tokio::fs::symlink_metadata(path).await {
		Ok(m) => m,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
		Err(e) => return Err(Error::Io(e)),
	};
	// a directory at a latest path is not a version
	if meta.is_dir() {
		return Ok(None);
	}
	let id = FileId::of(&meta);
	let xattrs = match md::get_all(path).await {
		Ok(x) => x,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
		Err(e) => return Err(Error::Io(e)),
	};
	let version_id = xattrs
		.get(md::XATTR_VERSION_ID)
		.and_then(|s| s.parse().ok())
		.unwrap_or(VersionId::Stat {
			mtime_ns: id.mtime_ns,
			ino: id.ino,
		});
	let prev_version_id = xattrs
		.get(md::XATTR_PREV_VERSION_ID)
		.and_then(|s| s.parse().ok());
	let delete_marker = xattrs
		.get(md::XATTR_DELETE_MARKER)
		.map(|v| v == "true")
		.unwrap_or(false);
	Ok(Some(VersionInfo {
		id,
		version_id,
		prev_version_id,
		delete_marker,
	}))
}

/// Publish a staged upload at the latest path of `key`, displacing the
/// current latest according to the bucket's versioning mode. Bounded
/// retries absorb identity races with concurrent writers and racily
/// removed parent directories.
pub(crate) async fn publish_staged(store: &Store, staging: &Path, key: &str) -> Result<(), Error> {
	let latest_path = store.mapper().file_path(key)?;
	let retries = store.config().rename_retries;
	let mut attempt = 0u32;
	loop {
		match publish_once(store, staging, key, &latest_path).await {
			Ok(()) => return Ok(()),
			Err(e) if e.is_retryable_race() && attempt < retries => {
				debug!("publish race on {} (attempt {}): {}", key, attempt, e);
			}
			Err(Error::Io(e))
				if e.kind() == std::io::ErrorKind::NotFound && attempt < retries =>
			{
				// an intermediate directory was racily removed; recreate it
				if let Some(parent) = latest_path.parent() {
					safe_ops::create_dirs_idempotent(parent, store.dir_mode()).await?;
				}
			}
			Err(e) => return Err(e),
		}
		attempt += 1;
	}
}

async fn publish_once(
	store: &Store,
	staging: &Path,
	key: &str,
	latest_path: &Path,
) -> Result<(), Error> {
	match store.versioning() {
		VersioningMode::Disabled => {
			// plain rename overwrites the latest atomically
			tokio::fs::rename(staging, latest_path)
				.await
				.map_err(Error::Io)
		}
		mode => {
			let staging_id = safe_ops::file_id_of(staging).await.map_err(Error::Io)?;
			displace_latest(store, key, latest_path, mode).await?;
			safe_ops::safe_move(
				staging,
				latest_path,
				staging_id,
				&store.mapper().lost_found_dir(),
			)
			.await
		}
	}
}

/// Make room at the latest path according to the mode table and return the
/// displaced latest, if there was one
pub(crate) async fn displace_latest(
	store: &Store,
	key: &str,
	latest_path: &Path,
	mode: VersioningMode,
) -> Result<Option<VersionInfo>, Error> {
	let latest = read_version_info(latest_path).await?;
	match mode {
		VersioningMode::Suspended => {
			if let Some(l) = &latest {
				if l.version_id.is_null() {
					// a null latest is replaced outright, it must not
					// survive as a second null version
					safe_ops::safe_unlink(latest_path, l.id, &store.mapper().lost_found_dir())
						.await?;
					return Ok(None);
				}
			}
			// the incoming write takes the null id, so any null sidecar
			// has to go first
			drop_null_sidecar(store, key).await?;
			if let Some(l) = &latest {
				displace_to_versions(store, key, latest_path, l).await?;
			}
			Ok(latest)
		}
		VersioningMode::Enabled => {
			if let Some(l) = &latest {
				displace_to_versions(store, key, latest_path, l).await?;
			}
			Ok(latest)
		}
		VersioningMode::Disabled => Ok(None),
	}
}

async fn displace_to_versions(
	store: &Store,
	key: &str,
	latest_path: &Path,
	latest: &VersionInfo,
) -> Result<(), Error> {
	let versioned_path = store.mapper().version_path(key, &latest.version_id)?;
	if let Some(parent) = versioned_path.parent() {
		safe_ops::create_dirs_idempotent(parent, store.dir_mode()).await?;
	}
	safe_ops::safe_move(
		latest_path,
		&versioned_path,
		latest.id,
		&store.mapper().lost_found_dir(),
	)
	.await
}

async fn drop_null_sidecar(store: &Store, key: &str) -> Result<(), Error> {
	let path = store.mapper().version_path(key, &VersionId::Null)?;
	match safe_ops::file_id_of(&path).await {
		Ok(id) => {
			match safe_ops::safe_unlink(&path, id, &store.mapper().lost_found_dir()).await {
				Ok(()) => Ok(()),
				// someone else already dropped it
				Err(e) if e.is_retryable_race() => Ok(()),
				Err(e) => Err(e),
			}
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(Error::Io(e)),
	}
}

/// Create a delete marker in `.versions/` for `key` and return its version
/// id: the marker file's own mtime-ino id in enabled mode, `null` while
/// suspended
pub(crate) async fn create_delete_marker(
	store: &Store,
	key: &str,
	prev: Option<&VersionId>,
) -> Result<VersionId, Error> {
	safe_ops::create_dirs_idempotent(&store.mapper().uploads_dir(), store.dir_mode()).await?;
	let staging = store.mapper().new_staging_path();
	let file = tokio::fs::OpenOptions::new()
		.write(true)
		.create_new(true)
		.mode(store.file_mode())
		.open(&staging)
		.await
		.map_err(Error::Io)?;
	drop(file);

	let meta = tokio::fs::symlink_metadata(&staging)
		.await
		.map_err(Error::Io)?;
	let marker_vid = match store.versioning() {
		VersioningMode::Enabled => VersionId::of(&meta),
		_ => VersionId::Null,
	};

	let mut xattrs = XattrMap::new();
	xattrs.insert(md::XATTR_DELETE_MARKER.to_string(), "true".to_string());
	xattrs.insert(md::XATTR_VERSION_ID.to_string(), marker_vid.to_string());
	if let Some(prev) = prev {
		xattrs.insert(md::XATTR_PREV_VERSION_ID.to_string(), prev.to_string());
	}
	md::set_all(&staging, &xattrs).await.map_err(Error::Io)?;

	let versioned_path = store.mapper().version_path(key, &marker_vid)?;
	if let Some(parent) = versioned_path.parent() {
		safe_ops::create_dirs_idempotent(parent, store.dir_mode()).await?;
	}
	safe_ops::safe_move(
		&staging,
		&versioned_path,
		FileId::of(&meta),
		&store.mapper().lost_found_dir(),
	)
	.await?;
	Ok(marker_vid)
}

struct Candidate {
	path: PathBuf,
	info: VersionInfo,
}

/// After a deletion exposed a gap at the latest path, move the most recent
/// surviving version back into place. A collision with a concurrent latest
/// writer aborts the promotion silently.
pub(crate) async fn promote_prior(
	store: &Store,
	key: &str,
	deleted: &VersionInfo,
) -> Result<(), Error> {
	let latest_path = store.mapper().file_path(key)?;
	let retries = store.config().rename_retries;
	for attempt in 0..=retries {
		// a concurrent writer may have published a new latest already
		if read_version_info(&latest_path).await?.is_some() {
			return Ok(());
		}
		let candidate = match find_candidate(store, key, deleted).await? {
			Some(c) => c,
			None => return Ok(()),
		};
		if candidate.info.delete_marker {
			return Ok(());
		}
		if deleted.delete_marker && candidate.info.id.mtime_ns > deleted.id.mtime_ns {
			// a version newer than the deleted marker exists, so the marker
			// was not the logical latest and nothing is exposed
			return Ok(());
		}
		match safe_ops::safe_move(
			&candidate.path,
			&latest_path,
			candidate.info.id,
			&store.mapper().lost_found_dir(),
		)
		.await
		{
			Ok(()) => return Ok(()),
			Err(e) if e.is_retryable_race() => {
				debug!("promotion race on {} (attempt {}): {}", key, attempt, e);
			}
			Err(e) => return Err(e),
		}
	}
	Ok(())
}

async fn find_candidate(
	store: &Store,
	key: &str,
	deleted: &VersionInfo,
) -> Result<Option<Candidate>, Error> {
	// prefer the deleted version's recorded predecessor
	if let Some(prev) = &deleted.prev_version_id {
		let path = store.mapper().version_path(key, prev)?;
		if let Some(info) = read_version_info(&path).await? {
			return Ok(Some(Candidate { path, info }));
		}
	}
	// otherwise scan the sidecar directory for the newest entry of this key
	let (_, base) = split_key(key);
	let vdir = store.mapper().versions_dir_of(key)?;
	let mut rd = match tokio::fs::read_dir(&vdir).await {
		Ok(rd) => rd,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
		Err(e) => return Err(Error::Io(e)),
	};
	let mut best: Option<Candidate> = None;
	while let Some(ent) = rd.next_entry().await.map_err(Error::Io)? {
		let name = match ent.file_name().into_string() {
			Ok(n) => n,
			Err(_) => continue,
		};
		match split_version_name(&name) {
			Some((b, _)) if b == base => (),
			_ => continue,
		}
		let path = vdir.join(&name);
		if let Some(info) = read_version_info(&path).await? {
			if best
				.as_ref()
				.map_or(true, |b| info.id.mtime_ns > b.info.id.mtime_ns)
			{
				best = Some(Candidate { path, info });
			}
		}
	}
	Ok(best)
}

//! Safe link/unlink/move primitives.
//!
//! Plain `rename` and `unlink` race with concurrent writers publishing to
//! the same key: between sampling a file's identity and acting on its path,
//! the directory entry may already point at a different inode. These
//! primitives verify the victim's (ino, mtimeNs) identity around the
//! syscall and surface a mismatch as a retryable race.

use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use nsfs_util::data::gen_id_hex;
use nsfs_util::error::Error;

use crate::ident::FileId;

/// Identity of the inode a path currently points at, without following
/// symlinks
pub async fn file_id_of(path: &Path) -> Result<FileId, io::Error> {
	let meta = tokio::fs::symlink_metadata(path).await?;
	Ok(FileId::of(&meta))
}

/// Link `src` into `dst`, verifying that the linked inode is still the one
/// identified by `expected`. On mismatch the new entry is torn down and a
/// race is reported. An existing `dst` is a race as well.
pub async fn safe_link(src: &Path, dst: &Path, expected: FileId) -> Result<(), Error> {
	match tokio::fs::hard_link(src, dst).await {
		Ok(()) => (),
		Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
			return Err(Error::RaceDetected(format!(
				"link destination {} already exists",
				dst.display()
			)));
		}
		Err(e) => return Err(Error::Io(e)),
	}
	let meta = tokio::fs::symlink_metadata(dst).await.map_err(Error::Io)?;
	if FileId::of(&meta) != expected {
		if let Err(e) = tokio::fs::remove_file(dst).await {
			warn!(
				"safe_link: unable to tear down mismatched link {}: {}",
				dst.display(),
				e
			);
		}
		return Err(Error::RaceDetected(format!(
			"identity changed while linking {} to {}",
			src.display(),
			dst.display()
		)));
	}
	Ok(())
}

/// Unlink `target` only if it still is the inode identified by `expected`.
/// The entry is first renamed into a quarantine path under `lost_found` so
/// that a racing writer's replacement is never destroyed: on mismatch the
/// entry is moved back and a race is reported.
pub async fn safe_unlink(target: &Path, expected: FileId, lost_found: &Path) -> Result<(), Error> {
	tokio::fs::create_dir_all(lost_found)
		.await
		.map_err(Error::Io)?;
	let quarantine = lost_found.join(gen_id_hex());
	match tokio::fs::rename(target, &quarantine).await {
		Ok(()) => (),
		Err(e) if e.kind() == io::ErrorKind::NotFound => {
			return Err(Error::RaceDetected(format!(
				"unlink victim {} disappeared",
				target.display()
			)));
		}
		Err(e) => return Err(Error::Io(e)),
	}
	let meta = tokio::fs::symlink_metadata(&quarantine)
		.await
		.map_err(Error::Io)?;
	if FileId::of(&meta) != expected {
		if let Err(e) = tokio::fs::rename(&quarantine, target).await {
			error!(
				"safe_unlink: unable to restore {} from quarantine {}: {}",
				target.display(),
				quarantine.display(),
				e
			);
		}
		return Err(Error::RaceDetected(format!(
			"identity changed while unlinking {}",
			target.display()
		)));
	}
	tokio::fs::remove_file(&quarantine).await.map_err(Error::Io)?;
	Ok(())
}

/// Move `src` to `dst` preserving the inode: link into place, then unlink
/// the source entry
pub async fn safe_move(
	src: &Path,
	dst: &Path,
	expected: FileId,
	lost_found: &Path,
) -> Result<(), Error> {
	safe_link(src, dst, expected).await?;
	safe_unlink(src, expected, lost_found).await
}

/// Create a directory path with the given mode, tolerating concurrent
/// creators. Callers re-run this when a move hits ENOENT on an intermediate
/// directory that was racily removed.
pub async fn create_dirs_idempotent(path: &Path, mode: u32) -> Result<(), Error> {
	let path = path.to_owned();
	let res = tokio::task::spawn_blocking(move || {
		let mut builder = std::fs::DirBuilder::new();
		builder.recursive(true).mode(mode);
		builder.create(&path)
	})
	.await
	.map_err(|e| Error::Message(format!("create dirs task failed: {}", e)))?;
	match res {
		Ok(()) => Ok(()),
		Err(e)
			if e.raw_os_error() == Some(libc::EEXIST)
				|| e.raw_os_error() == Some(libc::EISDIR) =>
		{
			Ok(())
		}
		Err(e) => Err(Error::Io(e)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::path::PathBuf;

	fn lost_found(root: &Path) -> PathBuf {
		root.join("lost+found")
	}

	#[tokio::test]
	async fn safe_move_preserves_inode() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let root: &Path = tmp.as_ref();
		let src = root.join("src");
		let dst = root.join("dst");
		tokio::fs::write(&src, b"payload").await.unwrap();

		let id = file_id_of(&src).await.unwrap();
		safe_move(&src, &dst, id, &lost_found(root)).await.unwrap();

		assert!(!src.exists());
		assert_eq!(file_id_of(&dst).await.unwrap(), id);
		assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"payload");
	}

	#[tokio::test]
	async fn safe_unlink_spares_replacement() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let root: &Path = tmp.as_ref();
		let target = root.join("obj");
		tokio::fs::write(&target, b"old").await.unwrap();
		let stale = file_id_of(&target).await.unwrap();

		// a concurrent writer replaces the entry with a new inode
		tokio::fs::remove_file(&target).await.unwrap();
		tokio::fs::write(&target, b"new").await.unwrap();

		let err = safe_unlink(&target, stale, &lost_found(root))
			.await
			.unwrap_err();
		assert!(err.is_retryable_race());

		// the new occupant survived in place
		assert_eq!(tokio::fs::read(&target).await.unwrap(), b"new");
	}

	#[tokio::test]
	async fn safe_link_rejects_existing_destination() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let root: &Path = tmp.as_ref();
		let src = root.join("src");
		let dst = root.join("dst");
		tokio::fs::write(&src, b"a").await.unwrap();
		tokio::fs::write(&dst, b"b").await.unwrap();

		let id = file_id_of(&src).await.unwrap();
		let err = safe_link(&src, &dst, id).await.unwrap_err();
		assert!(err.is_retryable_race());
		assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"b");
	}

	#[tokio::test]
	async fn safe_unlink_missing_target_is_race() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let root: &Path = tmp.as_ref();
		let id = FileId {
			ino: 1,
			mtime_ns: 1,
		};
		let err = safe_unlink(&root.join("gone"), id, &lost_found(root))
			.await
			.unwrap_err();
		assert!(err.is_retryable_race());
	}
}

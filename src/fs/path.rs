//! Mapping between object keys and filesystem paths, with bucket boundary
//! containment

use std::path::{Path, PathBuf};

use nsfs_util::config::Config;
use nsfs_util::data::gen_id_hex;
use nsfs_util::error::Error;

use crate::ident::VersionId;

pub const VERSIONS_DIR: &str = ".versions";
pub const UPLOADS_DIR: &str = "uploads";
pub const MULTIPART_UPLOADS_DIR: &str = "multipart-uploads";
pub const LOST_FOUND_DIR: &str = "lost+found";

/// Translates (key, version) pairs of one bucket to filesystem paths and
/// answers whether a resolved path is still contained in the bucket
pub struct PathMapper {
	bucket_root: PathBuf,
	bucket_root_real: PathBuf,
	tmp_dir: PathBuf,
	tmp_dir_name: String,
	folder_name: String,
	check_boundaries: bool,
}

impl PathMapper {
	pub async fn new(bucket_root: PathBuf, bucket_id: &str, config: &Config) -> Result<Self, Error> {
		let bucket_root_real = tokio::fs::canonicalize(&bucket_root)
			.await
			.map_err(|e| Error::Message(format!(
				"unable to resolve bucket root {}: {}",
				bucket_root.display(),
				e
			)))?;
		let tmp_dir_name = format!("{}_{}", config.temp_dir_name, bucket_id);
		let tmp_dir = bucket_root.join(&tmp_dir_name);
		Ok(Self {
			bucket_root,
			bucket_root_real,
			tmp_dir,
			tmp_dir_name,
			folder_name: config.folder_object_name.clone(),
			check_boundaries: config.check_bucket_boundaries,
		})
	}

	pub fn bucket_root(&self) -> &Path {
		&self.bucket_root
	}

	/// Entry name of the per-bucket temp directory, skipped by listings
	pub fn tmp_dir_name(&self) -> &str {
		&self.tmp_dir_name
	}

	/// Name of the sentinel file holding a directory object's body
	pub fn folder_name(&self) -> &str {
		&self.folder_name
	}

	/// Keys with relative escapes are rejected outright; `normalize` style
	/// cleanup would miss `a/./../b` forms, the substring check does not.
	/// The sidecar directory and the folder sentinel are reserved names.
	pub fn validate_key(&self, key: &str) -> Result<(), Error> {
		if key.is_empty() || key.starts_with('/') || key.contains("./") {
			return Err(Error::bad_request(format!("invalid key: {:?}", key)));
		}
		if key
			.split('/')
			.any(|c| c == VERSIONS_DIR || c == self.folder_name)
		{
			return Err(Error::bad_request(format!(
				"reserved name in key: {:?}",
				key
			)));
		}
		Ok(())
	}

	/// Path of the file holding the object's bytes; for directory objects
	/// (keys ending in `/`) this is the folder sentinel inside the directory
	pub fn file_path(&self, key: &str) -> Result<PathBuf, Error> {
		self.validate_key(key)?;
		let p = self.bucket_root.join(key);
		if key.ends_with('/') {
			Ok(p.join(&self.folder_name))
		} else {
			Ok(p)
		}
	}

	/// Path carrying the object's metadata xattrs: the directory itself for
	/// directory objects, the data file otherwise
	pub fn md_path(&self, key: &str) -> Result<PathBuf, Error> {
		self.validate_key(key)?;
		Ok(self.bucket_root.join(key))
	}

	/// `.versions/` sidecar path of a specific version of a key
	pub fn version_path(&self, key: &str, vid: &VersionId) -> Result<PathBuf, Error> {
		self.validate_key(key)?;
		let (dir, base) = split_key(key);
		if base.is_empty() {
			return Err(Error::bad_request(format!(
				"versioned access not supported for key {:?}",
				key
			)));
		}
		Ok(self
			.bucket_root
			.join(dir)
			.join(VERSIONS_DIR)
			.join(crate::ident::version_file_name(base, vid)))
	}

	/// `.versions/` directory that holds the sidecars of a key
	pub fn versions_dir_of(&self, key: &str) -> Result<PathBuf, Error> {
		self.validate_key(key)?;
		let (dir, _) = split_key(key);
		Ok(self.bucket_root.join(dir).join(VERSIONS_DIR))
	}

	/// Multipart scratch directory of an upload id
	pub fn mpu_path(&self, obj_id: &str) -> PathBuf {
		self.tmp_dir.join(MULTIPART_UPLOADS_DIR).join(obj_id)
	}

	pub fn uploads_dir(&self) -> PathBuf {
		self.tmp_dir.join(UPLOADS_DIR)
	}

	pub fn lost_found_dir(&self) -> PathBuf {
		self.tmp_dir.join(LOST_FOUND_DIR)
	}

	/// A fresh unique staging path for an upload in flight
	pub fn new_staging_path(&self) -> PathBuf {
		self.uploads_dir().join(gen_id_hex())
	}

	/// Whether a path is inside the bucket: first a textual prefix check,
	/// then symlink resolution. New leaves that do not exist yet resolve
	/// through their closest existing ancestor.
	pub async fn is_in_bucket(&self, path: &Path) -> Result<bool, Error> {
		if !path.starts_with(&self.bucket_root) && !path.starts_with(&self.bucket_root_real) {
			return Ok(false);
		}
		let mut current = path.to_path_buf();
		loop {
			match tokio::fs::canonicalize(&current).await {
				Ok(real) => return Ok(real.starts_with(&self.bucket_root_real)),
				Err(e) => match e.raw_os_error() {
					Some(code) if code == libc::ENOENT => match current.parent() {
						Some(parent) => current = parent.to_path_buf(),
						None => return Ok(false),
					},
					Some(code) if code == libc::EACCES => return Ok(false),
					_ => return Err(Error::Io(e)),
				},
			}
		}
	}

	/// Enforce the boundary: access outside the bucket root is denied
	pub async fn check_in_bucket(&self, path: &Path) -> Result<(), Error> {
		if !self.check_boundaries {
			return Ok(());
		}
		if self.is_in_bucket(path).await? {
			Ok(())
		} else {
			warn!("path escapes bucket boundary: {}", path.display());
			Err(Error::unauthorized(format!(
				"path escapes bucket boundary: {}",
				path.display()
			)))
		}
	}
}

/// Split a key into its directory part (including the trailing `/`, possibly
/// empty) and its basename. Directory-object keys split before their own
/// trailing slash.
pub fn split_key(key: &str) -> (&str, &str) {
	let trimmed = key.strip_suffix('/').unwrap_or(key);
	match trimmed.rfind('/') {
		Some(i) => (&key[..=i], &trimmed[i + 1..]),
		None => ("", trimmed),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn mapper_at(root: &Path) -> PathMapper {
		PathMapper::new(root.to_path_buf(), "bkt1", &Config::default())
			.await
			.unwrap()
	}

	#[test]
	fn key_splitting() {
		assert_eq!(split_key("a/b/c"), ("a/b/", "c"));
		assert_eq!(split_key("c"), ("", "c"));
		assert_eq!(split_key("a/b/"), ("a/", "b"));
		assert_eq!(split_key("a/"), ("", "a"));
	}

	#[tokio::test]
	async fn path_shapes() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let root: &Path = tmp.as_ref();
		let mapper = mapper_at(root).await;

		assert_eq!(mapper.file_path("a/b").unwrap(), root.join("a/b"));
		assert_eq!(mapper.md_path("a/b").unwrap(), root.join("a/b"));
		assert_eq!(
			mapper.file_path("a/d/").unwrap(),
			root.join("a/d").join(".folder")
		);
		assert_eq!(mapper.md_path("a/d/").unwrap(), root.join("a/d/"));

		let vid = VersionId::Null;
		assert_eq!(
			mapper.version_path("a/b", &vid).unwrap(),
			root.join("a").join(".versions").join("b_null")
		);
	}

	#[tokio::test]
	async fn escape_keys_rejected() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let root: &Path = tmp.as_ref();
		let mapper = mapper_at(root).await;

		for bad in ["../x", "a/../b", "./x", "a/./b", "/abs", ""] {
			assert!(mapper.file_path(bad).is_err(), "accepted {:?}", bad);
		}
	}

	#[tokio::test]
	async fn symlink_escape_detected() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let root: &Path = tmp.as_ref();
		let outside = mktemp::Temp::new_dir().unwrap();
		let outside_path: &Path = outside.as_ref();
		let mapper = mapper_at(root).await;

		std::os::unix::fs::symlink(outside_path, root.join("ld2")).unwrap();

		assert!(!mapper.is_in_bucket(&root.join("ld2/f4")).await.unwrap());
		assert!(mapper
			.check_in_bucket(&root.join("ld2/f4"))
			.await
			.unwrap_err()
			.code()
			.eq("UNAUTHORIZED"));

		// a leaf that does not exist yet resolves through its parent
		assert!(mapper.is_in_bucket(&root.join("new/leaf")).await.unwrap());
	}
}

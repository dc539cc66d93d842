//! The `Store` value: one bucket projected onto a directory tree, plus the
//! process-wide shared resources injected into it at construction

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use nsfs_fs::buffer_pool::BufferPool;
use nsfs_fs::dir_cache::DirCache;
use nsfs_fs::path::PathMapper;
use nsfs_util::config::Config;
use nsfs_util::error::Error;

use crate::object::{AccessMode, BackendKind, VersioningMode};

/// Process-wide resources shared by every bucket store: the parsed
/// configuration, the IO buffer pool and the two directory caches. There is
/// deliberately no global state; everything is owned here and injected.
pub struct StoreShared {
	pub config: Arc<Config>,
	pub buf_pool: Arc<BufferPool>,
	pub dir_cache: Arc<DirCache>,
	pub versions_dir_cache: Arc<DirCache>,
}

impl StoreShared {
	pub fn new(config: Config) -> Arc<Self> {
		let config = Arc::new(config);
		let buf_pool = BufferPool::new(
			config.buf_pool_mem_limit,
			config.buf_size,
			Duration::from_millis(config.io_stream_item_timeout_ms),
			Duration::from_millis(config.warn_threshold_ms),
		);
		let dir_cache = DirCache::new(
			config.dir_cache_max_total_size,
			config.dir_cache_min_dir_size,
			config.dir_cache_max_dir_size,
			false,
		);
		let versions_dir_cache = DirCache::new(
			config.dir_cache_max_total_size,
			config.dir_cache_min_dir_size,
			config.dir_cache_max_dir_size,
			true,
		);
		Arc::new(Self {
			config,
			buf_pool,
			dir_cache,
			versions_dir_cache,
		})
	}
}

/// Sink for per-operation filesystem statistics; reporting is
/// fire-and-forget and never fails an operation
pub trait FsStatsSink: Send + Sync {
	fn record(&self, op: &'static str, elapsed: Duration, ok: bool);
}

/// Per-request filesystem context supplied by the caller
#[derive(Clone)]
pub struct ReqCtx {
	pub uid: u32,
	pub gid: u32,
	pub backend_tag: Option<String>,
	pub warn_threshold_ms: u64,
	pub cancel: CancellationToken,
	pub stats: Option<Arc<dyn FsStatsSink>>,
}

impl Default for ReqCtx {
	fn default() -> Self {
		Self {
			uid: 0,
			gid: 0,
			backend_tag: None,
			warn_threshold_ms: 100,
			cancel: CancellationToken::new(),
			stats: None,
		}
	}
}

impl ReqCtx {
	/// Checked before and after every awaited IO of the read and upload loops
	pub fn check_cancelled(&self) -> Result<(), Error> {
		if self.cancel.is_cancelled() {
			Err(Error::Message("request cancelled".into()))
		} else {
			Ok(())
		}
	}

	/// Report one operation's duration; slow operations are logged
	pub fn observe(&self, op: &'static str, started: Instant, ok: bool) {
		let elapsed = started.elapsed();
		if elapsed.as_millis() as u64 >= self.warn_threshold_ms {
			warn!("slow fs operation {} took {:?}", op, elapsed);
		}
		if let Some(stats) = &self.stats {
			stats.record(op, elapsed, ok);
		}
	}
}

/// Construction parameters of one bucket store
pub struct StoreParams {
	pub bucket_root: PathBuf,
	pub bucket_id: String,
	pub versioning: VersioningMode,
	pub access: AccessMode,
	pub backend: BackendKind,
	/// Force md5 computation on every upload to this bucket
	pub force_md5: bool,
}

/// One bucket: a root directory treated as an S3 bucket
pub struct Store {
	shared: Arc<StoreShared>,
	mapper: PathMapper,
	bucket_id: String,
	versioning: RwLock<VersioningMode>,
	access: AccessMode,
	backend: BackendKind,
	force_md5: bool,
}

impl Store {
	pub async fn open(shared: Arc<StoreShared>, params: StoreParams) -> Result<Store, Error> {
		if params.versioning != VersioningMode::Disabled && !shared.config.versioning_enabled {
			return Err(Error::bad_request(
				"versioning is disabled by configuration",
			));
		}
		let mapper =
			PathMapper::new(params.bucket_root, &params.bucket_id, &shared.config).await?;
		Ok(Store {
			shared,
			mapper,
			bucket_id: params.bucket_id,
			versioning: RwLock::new(params.versioning),
			access: params.access,
			backend: params.backend,
			force_md5: params.force_md5,
		})
	}

	pub fn bucket_id(&self) -> &str {
		&self.bucket_id
	}

	pub fn backend(&self) -> BackendKind {
		self.backend
	}

	pub fn force_md5(&self) -> bool {
		self.force_md5
	}

	pub(crate) fn mapper(&self) -> &PathMapper {
		&self.mapper
	}

	pub(crate) fn shared(&self) -> &StoreShared {
		&self.shared
	}

	pub(crate) fn config(&self) -> &Config {
		&self.shared.config
	}

	/// Effective mode of newly created files, after umask
	pub(crate) fn file_mode(&self) -> u32 {
		self.config().base_mode_file & !self.config().umask
	}

	/// Effective mode of newly created directories, after umask
	pub(crate) fn dir_mode(&self) -> u32 {
		self.config().base_mode_dir & !self.config().umask
	}

	pub fn versioning(&self) -> VersioningMode {
		*self.versioning.read().unwrap()
	}

	/// Administrative transition of the versioning mode. Once versioning was
	/// enabled it can only be suspended, never fully disabled again.
	pub fn set_bucket_versioning(&self, mode: VersioningMode) -> Result<(), Error> {
		if mode != VersioningMode::Disabled && !self.shared.config.versioning_enabled {
			return Err(Error::bad_request(
				"versioning is disabled by configuration",
			));
		}
		let mut current = self.versioning.write().unwrap();
		if mode == VersioningMode::Disabled && *current != VersioningMode::Disabled {
			return Err(Error::bad_request(
				"versioning cannot be disabled once enabled",
			));
		}
		info!(
			"bucket {}: versioning {:?} -> {:?}",
			self.bucket_id, *current, mode
		);
		*current = mode;
		Ok(())
	}

	pub fn is_read_only(&self) -> bool {
		self.access == AccessMode::ReadOnly
	}

	pub(crate) fn require_writable(&self) -> Result<(), Error> {
		if self.is_read_only() {
			Err(Error::unauthorized("bucket is read-only"))
		} else {
			Ok(())
		}
	}

	// ---- directory management ----

	/// Create a new underlying-storage directory inside the bucket root
	pub async fn create_uls(&self, name: &str) -> Result<(), Error> {
		self.require_writable()?;
		self.mapper.validate_key(name)?;
		let path = self.mapper.bucket_root().join(name);
		self.mapper.check_in_bucket(&path).await?;
		match tokio::fs::create_dir(&path).await {
			Ok(()) => {
				let mode = std::fs::Permissions::from_mode(self.dir_mode());
				tokio::fs::set_permissions(&path, mode)
					.await
					.map_err(Error::Io)?;
				Ok(())
			}
			Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Err(Error::BucketExists),
			Err(e) => Err(Error::for_object(e)),
		}
	}

	/// Remove an underlying-storage directory; it must be empty
	pub async fn delete_uls(&self, name: &str) -> Result<(), Error> {
		self.require_writable()?;
		self.mapper.validate_key(name)?;
		let path = self.mapper.bucket_root().join(name);
		self.mapper.check_in_bucket(&path).await?;
		match tokio::fs::remove_dir(&path).await {
			Ok(()) => Ok(()),
			Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => Err(Error::NotEmpty),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(Error::for_object(e)),
		}
	}

	// ---- unimplemented surfaces, kept explicit ----

	pub async fn put_object_tagging(&self) -> Result<(), Error> {
		Err(Error::Unsupported("object tagging"))
	}

	pub async fn get_object_tagging(&self) -> Result<(), Error> {
		Err(Error::Unsupported("object tagging"))
	}

	pub async fn put_object_legal_hold(&self) -> Result<(), Error> {
		Err(Error::Unsupported("object legal hold"))
	}

	pub async fn put_object_retention(&self) -> Result<(), Error> {
		Err(Error::Unsupported("object retention"))
	}

	pub async fn put_object_acl(&self) -> Result<(), Error> {
		Err(Error::Unsupported("object acl"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::path::Path;

	fn shared() -> Arc<StoreShared> {
		StoreShared::new(Config::default())
	}

	async fn open_store(root: &Path) -> Store {
		Store::open(
			shared(),
			StoreParams {
				bucket_root: root.to_path_buf(),
				bucket_id: "bkt1".to_string(),
				versioning: VersioningMode::Disabled,
				access: AccessMode::ReadWrite,
				backend: BackendKind::Posix,
				force_md5: false,
			},
		)
		.await
		.unwrap()
	}

	#[tokio::test]
	async fn uls_lifecycle() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let root: &Path = tmp.as_ref();
		let store = open_store(root).await;

		store.create_uls("b1").await.unwrap();
		let err = store.create_uls("b1").await.unwrap_err();
		assert_eq!(err.code(), "BUCKET_ALREADY_EXISTS");

		tokio::fs::write(root.join("b1/x"), b"1").await.unwrap();
		let err = store.delete_uls("b1").await.unwrap_err();
		assert_eq!(err.code(), "NOT_EMPTY");

		tokio::fs::remove_file(root.join("b1/x")).await.unwrap();
		store.delete_uls("b1").await.unwrap();
		// deleting again is quiet
		store.delete_uls("b1").await.unwrap();
	}

	#[tokio::test]
	async fn versioning_transitions() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let root: &Path = tmp.as_ref();
		let store = open_store(root).await;

		assert!(store.versioning().is_disabled());
		store
			.set_bucket_versioning(VersioningMode::Enabled)
			.unwrap();
		store
			.set_bucket_versioning(VersioningMode::Suspended)
			.unwrap();
		assert!(store
			.set_bucket_versioning(VersioningMode::Disabled)
			.is_err());
		store
			.set_bucket_versioning(VersioningMode::Enabled)
			.unwrap();
		assert!(store.versioning().is_enabled());
	}
}

//! Contains the configuration struct, with one field per tunable the store reads

use std::io::Read;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;

/// Configuration of the NSFS store.
///
/// Field names are the snake_case forms of the `NSFS_*` tunables; each doc
/// comment names the original key and its effect.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
	/// NSFS_CALCULATE_MD5: compute an incremental md5 for every upload, even
	/// when the client did not send a content-md5 header
	#[serde(default)]
	pub calculate_md5: bool,

	/// NSFS_FOLDER_OBJECT_NAME: name of the sentinel file that holds the body
	/// of a directory object
	#[serde(default = "default_folder_object_name")]
	pub folder_object_name: String,

	/// NSFS_UMASK: permission bits cleared from the base modes when creating
	/// files and directories
	#[serde(default)]
	pub umask: u32,

	/// BASE_MODE_FILE: mode bits of newly created files, before umask
	#[serde(default = "default_base_mode_file")]
	pub base_mode_file: u32,

	/// BASE_MODE_DIR: mode bits of newly created directories, before umask
	#[serde(default = "default_base_mode_dir")]
	pub base_mode_dir: u32,

	/// NSFS_BUF_SIZE: size in bytes of one pooled IO buffer
	#[serde(default = "default_buf_size")]
	pub buf_size: usize,

	/// NSFS_BUF_POOL_MEM_LIMIT: total memory budget of the shared buffer
	/// pool; the number of buffers is this divided by `buf_size`
	#[serde(default = "default_buf_pool_mem_limit")]
	pub buf_pool_mem_limit: usize,

	/// IO_STREAM_ITEM_TIMEOUT: how long a borrower may wait for a pool buffer
	/// before the operation fails with a stream timeout, in milliseconds
	#[serde(default = "default_io_stream_item_timeout_ms")]
	pub io_stream_item_timeout_ms: u64,

	/// NSFS_DIR_CACHE_MIN_DIR_SIZE: floor added to every directory cache
	/// item's accounted memory usage
	#[serde(default = "default_dir_cache_min_dir_size")]
	pub dir_cache_min_dir_size: u64,

	/// NSFS_DIR_CACHE_MAX_DIR_SIZE: directories whose stat size exceeds this
	/// are not loaded into the cache; listings stream them instead
	#[serde(default = "default_dir_cache_max_dir_size")]
	pub dir_cache_max_dir_size: u64,

	/// NSFS_DIR_CACHE_MAX_TOTAL_SIZE: approximate memory bound of one
	/// directory cache
	#[serde(default = "default_dir_cache_max_total_size")]
	pub dir_cache_max_total_size: u64,

	/// NSFS_RENAME_RETRIES: bounded retry budget of the publish/displace move
	/// loops when racing writers are detected
	#[serde(default = "default_rename_retries")]
	pub rename_retries: u32,

	/// NSFS_TRIGGER_FSYNC: fsync uploaded files before publish and their
	/// parent directory after publish
	#[serde(default = "default_true")]
	pub trigger_fsync: bool,

	/// NSFS_CHECK_BUCKET_BOUNDARIES: resolve symlinks and refuse paths that
	/// escape the bucket root
	#[serde(default = "default_true")]
	pub check_bucket_boundaries: bool,

	/// NSFS_VERSIONING_ENABLED: global switch allowing buckets to enable
	/// object versioning
	#[serde(default = "default_true")]
	pub versioning_enabled: bool,

	/// NSFS_OPEN_READ_MODE: open mode of the read path, "r" for buffered
	/// reads
	#[serde(default = "default_open_read_mode")]
	pub open_read_mode: String,

	/// NSFS_REMOVE_PARTS_ON_COMPLETE: remove the multipart scratch directory
	/// once completion published the assembled object
	#[serde(default = "default_true")]
	pub remove_parts_on_complete: bool,

	/// NSFS_WARN_THRESHOLD_MS: filesystem operations slower than this are
	/// logged with a warning
	#[serde(default = "default_warn_threshold_ms")]
	pub warn_threshold_ms: u64,

	/// NSFS_BUF_WARMUP_SPARSE_FILE_READS: perform a 1-byte warm-up read on
	/// sparse files before borrowing a large pool buffer
	#[serde(default = "default_true")]
	pub buf_warmup_sparse_file_reads: bool,

	/// Name of the per-bucket temp directory; the actual directory is this
	/// suffixed with the bucket id
	#[serde(default = "default_temp_dir_name")]
	pub temp_dir_name: String,
}

fn default_folder_object_name() -> String {
	".folder".to_string()
}
fn default_base_mode_file() -> u32 {
	0o666
}
fn default_base_mode_dir() -> u32 {
	0o777
}
fn default_buf_size() -> usize {
	8 * 1024 * 1024
}
fn default_buf_pool_mem_limit() -> usize {
	256 * 1024 * 1024
}
fn default_io_stream_item_timeout_ms() -> u64 {
	120_000
}
fn default_dir_cache_min_dir_size() -> u64 {
	64
}
fn default_dir_cache_max_dir_size() -> u64 {
	64 * 1024 * 1024
}
fn default_dir_cache_max_total_size() -> u64 {
	256 * 1024 * 1024
}
fn default_rename_retries() -> u32 {
	10
}
fn default_open_read_mode() -> String {
	"r".to_string()
}
fn default_warn_threshold_ms() -> u64 {
	100
}
fn default_temp_dir_name() -> String {
	".nsfs_temp".to_string()
}
fn default_true() -> bool {
	true
}

impl Default for Config {
	fn default() -> Self {
		toml::from_str("").expect("empty config must deserialize from defaults")
	}
}

/// Read and parse configuration
pub fn read_config(config_file: PathBuf) -> Result<Config, Error> {
	info!("Reading configuration from {}", config_file.display());
	let mut file = std::fs::OpenOptions::new()
		.read(true)
		.open(config_file.as_path())?;

	let mut config = String::new();
	file.read_to_string(&mut config)?;

	Ok(toml::from_str(&config)?)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults() {
		let config = Config::default();
		assert_eq!(config.folder_object_name, ".folder");
		assert_eq!(config.buf_size, 8 * 1024 * 1024);
		assert_eq!(config.rename_retries, 10);
		assert!(config.trigger_fsync);
		assert!(!config.calculate_md5);
	}

	#[test]
	fn partial_override() {
		let config: Config = toml::from_str(
			r#"
			calculate_md5 = true
			rename_retries = 3
			temp_dir_name = ".scratch"
			"#,
		)
		.unwrap();
		assert!(config.calculate_md5);
		assert_eq!(config.rename_retries, 3);
		assert_eq!(config.temp_dir_name, ".scratch");
		assert_eq!(config.folder_object_name, ".folder");
	}
}

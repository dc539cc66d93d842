//! Directory entry caches validated by (ino, mtimeNs).
//!
//! Two caches share this shape: one loads plain directory listings, the
//! other also folds the `.versions/` subdirectory into each entry list so
//! versioned listings see one merged, sorted view. Entries are revalidated
//! against the directory's stat identity on every get, and directories over
//! the configured size cap are deliberately not expanded so listings fall
//! back to streaming them.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use quick_cache::sync::Cache as QuickCache;
use quick_cache::Weighter;

use nsfs_util::error::Error;

use crate::ident::{split_version_name, FileId, VersionId};
use crate::path::VERSIONS_DIR;

/// One directory entry as the listing engine consumes it
#[derive(Clone, Debug)]
pub struct DirEntry {
	/// Name of the entry inside its directory; version files keep their
	/// `_<version_id>` suffix
	pub name: String,
	/// Name with the version suffix stripped
	pub logical: String,
	/// Rank among versions of one logical name: the latest entry ranks
	/// first, then stat-derived versions newest first, then `null`
	pub sort_mtime: u64,
	pub is_dir: bool,
	/// Whether the entry was read from the `.versions/` subdirectory
	pub in_versions: bool,
	/// Parsed version id of `.versions/` entries
	pub version_id: Option<VersionId>,
}

/// A cached directory: the identity it was loaded under, and its sorted
/// entries unless the directory was over the size cap
pub struct CachedDir {
	pub id: FileId,
	pub entries: Option<Arc<Vec<DirEntry>>>,
}

#[derive(Clone)]
struct DirWeighter {
	min_item_size: u64,
}

impl Weighter<PathBuf, Arc<CachedDir>> for DirWeighter {
	fn weight(&self, _key: &PathBuf, val: &Arc<CachedDir>) -> u64 {
		let entries = val
			.entries
			.as_ref()
			.map(|ents| ents.iter().map(|e| e.name.len() as u64 + 4).sum())
			.unwrap_or(0u64);
		entries + self.min_item_size
	}
}

/// Memory-bounded LRU of sorted directory listings
pub struct DirCache {
	cache: QuickCache<PathBuf, Arc<CachedDir>, DirWeighter>,
	with_versions: bool,
	max_dir_size: u64,
}

impl DirCache {
	/// `max_total_size` bounds the cache's accounted memory,
	/// `min_item_size` is the usage floor of one item, and directories with
	/// a stat size above `max_dir_size` are never expanded
	pub fn new(
		max_total_size: u64,
		min_item_size: u64,
		max_dir_size: u64,
		with_versions: bool,
	) -> Arc<Self> {
		let opts = quick_cache::OptionsBuilder::new()
			.weight_capacity(max_total_size)
			.estimated_items_capacity(
				std::cmp::max(1, max_total_size / std::cmp::max(1, min_item_size)) as usize,
			)
			.build()
			.expect("cache options should be valid");
		let cache = QuickCache::with_options(
			opts,
			DirWeighter { min_item_size },
			Default::default(),
			Default::default(),
		);
		Arc::new(Self {
			cache,
			with_versions,
			max_dir_size,
		})
	}

	/// Get the listing of `dir`, revalidating any cached value against the
	/// directory's current (ino, mtimeNs). Concurrent loads of the same
	/// directory collapse onto one loader.
	pub async fn get(&self, dir: &Path) -> Result<Arc<CachedDir>, Error> {
		let meta = tokio::fs::metadata(dir).await.map_err(Error::Io)?;
		let id = FileId::of(&meta);
		for _ in 0..2 {
			match self.cache.get_value_or_guard_async(dir).await {
				Ok(hit) => {
					if hit.id == id {
						return Ok(hit);
					}
					self.cache.remove(dir);
				}
				Err(guard) => {
					let loaded = Arc::new(self.load(dir, &meta, id).await?);
					let _ = guard.insert(loaded.clone());
					return Ok(loaded);
				}
			}
		}
		// lost the revalidation race twice; serve a fresh uncached load
		let meta = tokio::fs::metadata(dir).await.map_err(Error::Io)?;
		let id = FileId::of(&meta);
		Ok(Arc::new(self.load(dir, &meta, id).await?))
	}

	async fn load(&self, dir: &Path, meta: &Metadata, id: FileId) -> Result<CachedDir, Error> {
		if meta.len() > self.max_dir_size {
			trace!(
				"directory {} over cache cap ({} > {}), leaving unexpanded",
				dir.display(),
				meta.len(),
				self.max_dir_size
			);
			return Ok(CachedDir { id, entries: None });
		}
		let mut entries = read_dir_entries(dir, false).await?;
		if self.with_versions {
			match read_dir_entries(&dir.join(VERSIONS_DIR), true).await {
				Ok(mut versions) => entries.append(&mut versions),
				Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound => (),
				Err(e) => return Err(e),
			}
			entries.sort_by(|a, b| {
				a.logical
					.cmp(&b.logical)
					.then_with(|| b.sort_mtime.cmp(&a.sort_mtime))
			});
		} else {
			entries.sort_by(|a, b| a.name.cmp(&b.name));
		}
		Ok(CachedDir {
			id,
			entries: Some(Arc::new(entries)),
		})
	}
}

async fn read_dir_entries(dir: &Path, in_versions: bool) -> Result<Vec<DirEntry>, Error> {
	let mut rd = tokio::fs::read_dir(dir).await.map_err(Error::Io)?;
	let mut out = Vec::new();
	while let Some(ent) = rd.next_entry().await.map_err(Error::Io)? {
		let name = match ent.file_name().into_string() {
			Ok(n) => n,
			Err(_) => continue,
		};
		if name == VERSIONS_DIR {
			continue;
		}
		let is_dir = ent.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
		let (logical, sort_mtime, version_id) = if in_versions {
			match split_version_name(&name) {
				Some((base, vid)) => {
					(base.to_string(), vid.mtime_ns().unwrap_or(0), Some(vid))
				}
				// not a well-formed version name, not a version
				None => continue,
			}
		} else {
			(name.clone(), u64::MAX, None)
		};
		out.push(DirEntry {
			name,
			logical,
			sort_mtime,
			is_dir,
			in_versions,
			version_id,
		});
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn sorted_and_revalidated() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let root: &Path = tmp.as_ref();
		tokio::fs::write(root.join("b"), b"").await.unwrap();
		tokio::fs::write(root.join("a"), b"").await.unwrap();

		let cache = DirCache::new(1 << 20, 64, 1 << 20, false);
		let listed = cache.get(root).await.unwrap();
		let names: Vec<_> = listed
			.entries
			.as_ref()
			.unwrap()
			.iter()
			.map(|e| e.name.clone())
			.collect();
		assert_eq!(names, vec!["a", "b"]);

		// adding an entry changes the directory identity and forces a reload
		tokio::fs::write(root.join("c"), b"").await.unwrap();
		let listed = cache.get(root).await.unwrap();
		assert_eq!(listed.entries.as_ref().unwrap().len(), 3);
	}

	#[tokio::test]
	async fn versions_are_merged_newest_first() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let root: &Path = tmp.as_ref();
		tokio::fs::write(root.join("key"), b"latest").await.unwrap();
		let vdir = root.join(VERSIONS_DIR);
		tokio::fs::create_dir(&vdir).await.unwrap();

		let old = VersionId::Stat {
			mtime_ns: 100,
			ino: 7,
		};
		let newer = VersionId::Stat {
			mtime_ns: 200,
			ino: 8,
		};
		for vid in [&old, &newer, &VersionId::Null] {
			tokio::fs::write(vdir.join(crate::ident::version_file_name("key", vid)), b"")
				.await
				.unwrap();
		}
		// a stray file in .versions is not a version
		tokio::fs::write(vdir.join("junk"), b"").await.unwrap();

		let cache = DirCache::new(1 << 20, 64, 1 << 20, true);
		let listed = cache.get(root).await.unwrap();
		let entries = listed.entries.as_ref().unwrap();
		let names: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
		let expected = vec![
			"key".to_string(),
			crate::ident::version_file_name("key", &newer),
			crate::ident::version_file_name("key", &old),
			"key_null".to_string(),
		];
		assert_eq!(names, expected);
		assert!(entries.iter().all(|e| e.logical == "key"));
	}

	#[tokio::test]
	async fn oversized_dir_left_unexpanded() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let root: &Path = tmp.as_ref();
		tokio::fs::write(root.join("x"), b"").await.unwrap();

		// a zero byte cap keeps every directory unexpanded
		let cache = DirCache::new(1 << 20, 64, 0, false);
		let listed = cache.get(root).await.unwrap();
		assert!(listed.entries.is_none());
	}
}

//! Listing engine: recursive prefix/delimiter/marker walk over the bucket
//! tree.
//!
//! Each directory level slices the prefix and marker at its own depth, so
//! subtrees wholly before the marker or outside the prefix are pruned
//! without being read. Directory listings come from the validated caches;
//! oversized directories are streamed entry by entry instead, and the
//! sorted-insertion result vector keeps the response ordered either way.

use std::cmp::Ordering;
use std::path::Path;

use futures::future::{BoxFuture, FutureExt};

use nsfs_fs::dir_cache::DirEntry;
use nsfs_fs::ident::{split_version_name, VersionId};
use nsfs_fs::md;
use nsfs_fs::path::VERSIONS_DIR;
use nsfs_util::error::Error;

use crate::get::{is_delete_marker, object_info_from};
use crate::object::{ListParams, ListResult, ObjectInfo};
use crate::store::{ReqCtx, Store};

const MAX_LIST_LIMIT: usize = 1000;

pub async fn list_objects(
	store: &Store,
	ctx: &ReqCtx,
	params: &ListParams,
) -> Result<ListResult, Error> {
	let started = std::time::Instant::now();
	let res = list_impl(store, params, false).await;
	ctx.observe("list_objects", started, res.is_ok());
	res
}

pub async fn list_object_versions(
	store: &Store,
	ctx: &ReqCtx,
	params: &ListParams,
) -> Result<ListResult, Error> {
	let started = std::time::Instant::now();
	let res = list_impl(store, params, true).await;
	ctx.observe("list_object_versions", started, res.is_ok());
	res
}

async fn list_impl(
	store: &Store,
	params: &ListParams,
	list_versions: bool,
) -> Result<ListResult, Error> {
	match params.delimiter.as_str() {
		"" | "/" => (),
		other => {
			return Err(Error::bad_request(format!(
				"invalid delimiter {:?}, only '/' is supported",
				other
			)))
		}
	}
	let limit = params.limit.unwrap_or(MAX_LIST_LIMIT).min(MAX_LIST_LIMIT);
	if limit == 0 {
		return Ok(ListResult::default());
	}
	let version_marker_mtime = match &params.version_id_marker {
		Some(s) => {
			if !list_versions {
				return Err(Error::bad_request(
					"version id marker is only valid when listing versions",
				));
			}
			if params.key_marker.is_empty() {
				return Err(Error::bad_request(
					"version id marker requires a key marker",
				));
			}
			let vid: VersionId = s.parse()?;
			Some(vid.mtime_ns().unwrap_or(0))
		}
		None => None,
	};

	let mut walker = Walker {
		store,
		prefix: params.prefix.clone(),
		delimited: params.delimiter == "/",
		key_marker: params.key_marker.clone(),
		version_marker_mtime,
		limit,
		list_versions,
		results: Vec::new(),
		is_truncated: false,
	};

	let dir_key = match walker.prefix.rfind('/') {
		Some(i) => walker.prefix[..=i].to_string(),
		None => String::new(),
	};
	walker.process_dir(dir_key).await?;

	let results = std::mem::take(&mut walker.results);
	let is_truncated = walker.is_truncated;

	let mut objects: Vec<ObjectInfo> = Vec::new();
	let mut common_prefixes = Vec::new();
	let mut last_key = None;
	let mut last_vid = None;
	for ent in &results {
		last_key = Some(ent.key.clone());
		if ent.common_prefix {
			common_prefixes.push(ent.key.clone());
			last_vid = None;
		} else {
			match stat_entry(store, ent, list_versions).await? {
				Some(info) => {
					last_vid = info.version_id;
					objects.push(info);
				}
				// raced away between the walk and the stat
				None => last_vid = ent.version_id,
			}
		}
	}

	let (next_marker, next_version_id_marker) = if is_truncated {
		let vid_marker = if list_versions {
			last_vid.map(|v| v.to_string())
		} else {
			None
		};
		(last_key, vid_marker)
	} else {
		(None, None)
	};

	Ok(ListResult {
		objects,
		common_prefixes,
		is_truncated,
		next_marker,
		next_version_id_marker,
	})
}

/// One raw walk result before the stat/metadata pass
#[derive(Clone, Debug)]
struct ResEntry {
	key: String,
	/// Secondary sort rank: versions of one key order newest first
	sort_mtime: u64,
	common_prefix: bool,
	dir_object: bool,
	in_versions: bool,
	/// On-disk file name, for `.versions/` results
	name: String,
	/// Directory key the entry was found under
	dir_key: String,
	version_id: Option<VersionId>,
	is_latest: bool,
}

fn cmp_entries(a: &ResEntry, b: &ResEntry) -> Ordering {
	a.key
		.cmp(&b.key)
		.then_with(|| b.sort_mtime.cmp(&a.sort_mtime))
}

struct Walker<'a> {
	store: &'a Store,
	prefix: String,
	delimited: bool,
	key_marker: String,
	/// Sort rank of the version id marker; `null` ranks last
	version_marker_mtime: Option<u64>,
	limit: usize,
	list_versions: bool,
	results: Vec<ResEntry>,
	is_truncated: bool,
}

impl<'a> Walker<'a> {
	/// Once truncated, anything sorting after the kept tail is irrelevant
	fn done_past(&self, key: &str) -> bool {
		self.is_truncated
			&& self
				.results
				.last()
				.map_or(false, |last| key > last.key.as_str())
	}

	/// Keep the result vector sorted; versioned names arrive out of order
	fn insert_entry(&mut self, ent: ResEntry) {
		let out_of_order = self
			.results
			.last()
			.map_or(false, |last| cmp_entries(last, &ent) == Ordering::Greater);
		if out_of_order {
			let pos = self
				.results
				.partition_point(|e| cmp_entries(e, &ent) != Ordering::Greater);
			self.results.insert(pos, ent);
		} else {
			self.results.push(ent);
		}
		if self.results.len() > self.limit {
			self.results.truncate(self.limit);
			self.is_truncated = true;
		}
	}

	fn process_dir(&mut self, dir_key: String) -> BoxFuture<'_, Result<(), Error>> {
		async move {
			// the sidecar tree is never walked as a directory of its own
			if dir_key.split('/').any(|c| c == VERSIONS_DIR) {
				return Ok(());
			}

			let prefix = self.prefix.clone();
			let marker = self.key_marker.clone();
			let n = dir_key.len();

			// keys in this directory cannot match a diverging prefix
			let prefix_dir = &prefix.as_bytes()[..prefix.len().min(n)];
			if !dir_key.as_bytes().starts_with(prefix_dir) {
				return Ok(());
			}
			let prefix_ent: &[u8] = if prefix.len() > n {
				&prefix.as_bytes()[n..]
			} else {
				b""
			};

			// the marker is past this whole subtree
			let marker_dir = &marker.as_bytes()[..marker.len().min(n)];
			if dir_key.as_bytes() < marker_dir {
				return Ok(());
			}
			let marker_curr: &[u8] =
				if marker.len() > n && &marker.as_bytes()[..n] == dir_key.as_bytes() {
					&marker.as_bytes()[n..]
				} else {
					b""
				};

			let dir_path = if dir_key.is_empty() {
				self.store.mapper().bucket_root().to_path_buf()
			} else {
				self.store.mapper().bucket_root().join(&dir_key)
			};

			// directories that escape the boundary or deny access are
			// skipped, not failed
			match self.store.mapper().check_in_bucket(&dir_path).await {
				Ok(()) => (),
				Err(Error::Unauthorized(_)) => return Ok(()),
				Err(e) => return Err(e),
			}

			// the directory itself may be a directory object
			if !dir_key.is_empty()
				&& dir_key.as_bytes() > marker.as_bytes()
				&& dir_key.as_bytes().starts_with(prefix.as_bytes())
				&& (!self.delimited || dir_key == prefix)
			{
				let is_dir_object = matches!(
					md::get_one(&dir_path, md::XATTR_DIR_CONTENT).await,
					Ok(Some(_))
				);
				if is_dir_object {
					self.insert_entry(ResEntry {
						key: dir_key.clone(),
						sort_mtime: u64::MAX,
						common_prefix: false,
						dir_object: true,
						in_versions: false,
						name: String::new(),
						dir_key: dir_key.clone(),
						version_id: None,
						is_latest: true,
					});
				}
			}

			let cached = if self.list_versions {
				self.store.shared().versions_dir_cache.get(&dir_path).await
			} else {
				self.store.shared().dir_cache.get(&dir_path).await
			};
			let cached = match cached {
				Ok(c) => c,
				// vanished or became unreadable while walking
				Err(Error::Io(ref e))
					if matches!(
						e.kind(),
						std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
					) =>
				{
					return Ok(())
				}
				Err(Error::Io(ref e)) if e.raw_os_error() == Some(libc::ENOTDIR) => {
					return Ok(())
				}
				Err(e) => return Err(e),
			};

			match &cached.entries {
				Some(entries) => {
					for ent in entries.iter() {
						if self.done_past(&format!("{}{}", dir_key, ent.logical)) {
							break;
						}
						self.process_entry(&dir_key, ent, prefix_ent, marker_curr)
							.await?;
					}
				}
				// over the cache cap: stream the directory unsorted
				None => {
					self.stream_dir(&dir_path, &dir_key, prefix_ent, marker_curr)
						.await?
				}
			}
			Ok(())
		}
		.boxed()
	}

	async fn stream_dir(
		&mut self,
		dir_path: &Path,
		dir_key: &str,
		prefix_ent: &[u8],
		marker_curr: &[u8],
	) -> Result<(), Error> {
		let mut rd = match tokio::fs::read_dir(dir_path).await {
			Ok(rd) => rd,
			Err(e)
				if matches!(
					e.kind(),
					std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
				) =>
			{
				return Ok(())
			}
			Err(e) => return Err(Error::Io(e)),
		};
		while let Some(de) = rd.next_entry().await.map_err(Error::Io)? {
			let name = match de.file_name().into_string() {
				Ok(n) => n,
				Err(_) => continue,
			};
			if name == VERSIONS_DIR {
				continue;
			}
			let is_dir = de.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
			let ent = DirEntry {
				logical: name.clone(),
				name,
				sort_mtime: u64::MAX,
				is_dir,
				in_versions: false,
				version_id: None,
			};
			self.process_entry(dir_key, &ent, prefix_ent, marker_curr)
				.await?;
		}
		if self.list_versions {
			let vdir = dir_path.join(VERSIONS_DIR);
			let mut rd = match tokio::fs::read_dir(&vdir).await {
				Ok(rd) => rd,
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
				Err(e) => return Err(Error::Io(e)),
			};
			while let Some(de) = rd.next_entry().await.map_err(Error::Io)? {
				let name = match de.file_name().into_string() {
					Ok(n) => n,
					Err(_) => continue,
				};
				let (base, vid) = match split_version_name(&name) {
					Some(x) => x,
					None => continue,
				};
				let logical = base.to_string();
				let ent = DirEntry {
					name: name.clone(),
					logical,
					sort_mtime: vid.mtime_ns().unwrap_or(0),
					is_dir: false,
					in_versions: true,
					version_id: Some(vid),
				};
				self.process_entry(dir_key, &ent, prefix_ent, marker_curr)
					.await?;
			}
		}
		Ok(())
	}

	async fn process_entry(
		&mut self,
		dir_key: &str,
		ent: &DirEntry,
		prefix_ent: &[u8],
		marker_curr: &[u8],
	) -> Result<(), Error> {
		let name = ent.name.as_str();
		// the bucket's temp dir and the folder sentinel never list
		if dir_key.is_empty() && name == self.store.mapper().tmp_dir_name() {
			return Ok(());
		}
		if !ent.in_versions && name == self.store.mapper().folder_name() {
			return Ok(());
		}

		let logical = ent.logical.as_str();
		if !logical.as_bytes().starts_with(prefix_ent) {
			return Ok(());
		}

		if ent.in_versions {
			if !self.version_after_marker(logical.as_bytes(), marker_curr, ent.sort_mtime) {
				return Ok(());
			}
			self.insert_entry(ResEntry {
				key: format!("{}{}", dir_key, logical),
				sort_mtime: ent.sort_mtime,
				common_prefix: false,
				dir_object: false,
				in_versions: true,
				name: name.to_string(),
				dir_key: dir_key.to_string(),
				version_id: ent.version_id,
				is_latest: false,
			});
			return Ok(());
		}

		if ent.is_dir {
			let child_key = format!("{}{}/", dir_key, name);
			if self.delimited {
				if child_key.as_str() > self.key_marker.as_str() {
					self.insert_entry(ResEntry {
						key: child_key,
						sort_mtime: u64::MAX,
						common_prefix: true,
						dir_object: false,
						in_versions: false,
						name: name.to_string(),
						dir_key: dir_key.to_string(),
						version_id: None,
						is_latest: false,
					});
				}
				return Ok(());
			}
			// subtree pruning against the marker happens on entry
			return self.process_dir(child_key).await;
		}

		// a latest object
		if !marker_curr.is_empty() {
			if self.list_versions {
				if !self.version_after_marker(name.as_bytes(), marker_curr, u64::MAX) {
					return Ok(());
				}
			} else if name.as_bytes() <= marker_curr {
				return Ok(());
			}
		}
		self.insert_entry(ResEntry {
			key: format!("{}{}", dir_key, name),
			sort_mtime: u64::MAX,
			common_prefix: false,
			dir_object: false,
			in_versions: false,
			name: name.to_string(),
			dir_key: dir_key.to_string(),
			version_id: None,
			is_latest: true,
		});
		Ok(())
	}

	/// Whether a versioned-order entry sorts strictly after the marker
	fn version_after_marker(&self, logical: &[u8], marker_curr: &[u8], sort_mtime: u64) -> bool {
		if marker_curr.is_empty() {
			return true;
		}
		match logical.cmp(marker_curr) {
			Ordering::Greater => true,
			Ordering::Less => false,
			Ordering::Equal => match self.version_marker_mtime {
				// versions order newest first, so "after" means older
				Some(marker_mtime) => sort_mtime < marker_mtime,
				None => false,
			},
		}
	}
}

/// Stat one raw result and build its `ObjectInfo`; entries that vanished
/// since the walk, and delete markers outside version listings, drop out
async fn stat_entry(
	store: &Store,
	ent: &ResEntry,
	list_versions: bool,
) -> Result<Option<ObjectInfo>, Error> {
	let mapper = store.mapper();
	let path = if ent.dir_object {
		mapper.md_path(&ent.key)?
	} else if ent.in_versions {
		mapper
			.bucket_root()
			.join(&ent.dir_key)
			.join(VERSIONS_DIR)
			.join(&ent.name)
	} else {
		mapper.bucket_root().join(&ent.key)
	};

	// entries that resolve outside the boundary are described by their
	// link itself rather than followed
	let contained = mapper.is_in_bucket(&path).await?;
	let meta = if contained {
		tokio::fs::metadata(&path).await
	} else {
		tokio::fs::symlink_metadata(&path).await
	};
	let meta = match meta {
		Ok(m) => m,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
		Err(e) => return Err(Error::Io(e)),
	};
	let xattrs = match md::get_all(&path).await {
		Ok(x) => x,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
		Err(_) => Default::default(),
	};
	if is_delete_marker(&xattrs) && !list_versions {
		return Ok(None);
	}
	let mut info = object_info_from(
		store,
		&ent.key,
		&meta,
		&xattrs,
		ent.version_id,
		ent.is_latest || ent.dir_object,
	);
	if ent.dir_object {
		info.size = xattrs
			.get(md::XATTR_DIR_CONTENT)
			.and_then(|v| v.parse().ok())
			.unwrap_or(0);
		info.version_id = None;
	}
	Ok(Some(info))
}

//! Object metadata persisted as `user.*` extended attributes

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

/// Metadata maps are kept in sorted order (`BTreeMap`), which is what keeps
/// downstream signature computations over them stable
pub type XattrMap = BTreeMap<String, String>;

pub const XATTR_USER_PREFIX: &str = "user.";

pub const XATTR_CONTENT_TYPE: &str = "user.content_type";
pub const XATTR_CONTENT_MD5: &str = "user.content_md5";
pub const XATTR_VERSION_ID: &str = "user.version_id";
pub const XATTR_PREV_VERSION_ID: &str = "user.prev_version_id";
pub const XATTR_DELETE_MARKER: &str = "user.delete_marker";
pub const XATTR_DIR_CONTENT: &str = "user.dir_content";

/// Reserved keys that live under `user.` but are never shown to clients
pub const INTERNAL_XATTRS: &[&str] = &[
	XATTR_CONTENT_TYPE,
	XATTR_CONTENT_MD5,
	XATTR_VERSION_ID,
	XATTR_PREV_VERSION_ID,
	XATTR_DELETE_MARKER,
	XATTR_DIR_CONTENT,
];

pub fn is_internal(key: &str) -> bool {
	INTERNAL_XATTRS.contains(&key)
}

/// Strip the `user.` prefix and drop the reserved internal keys, producing
/// the metadata map shown to clients
pub fn to_public(storage: &XattrMap) -> XattrMap {
	storage
		.iter()
		.filter(|(k, _)| k.starts_with(XATTR_USER_PREFIX) && !is_internal(k))
		.map(|(k, v)| (k[XATTR_USER_PREFIX.len()..].to_string(), v.clone()))
		.collect()
}

/// Prefix client-supplied metadata keys with `user.` for storage
pub fn to_storage(public: &XattrMap) -> XattrMap {
	public
		.iter()
		.map(|(k, v)| (format!("{}{}", XATTR_USER_PREFIX, k), v.clone()))
		.collect()
}

/// Read all xattrs of a path. Does not follow symlinks.
pub async fn get_all(path: &Path) -> Result<XattrMap, io::Error> {
	let path = path.to_owned();
	blocking(move || {
		let mut map = XattrMap::new();
		for name in xattr::list(&path)? {
			let name = match name.into_string() {
				Ok(n) => n,
				Err(_) => continue,
			};
			if let Some(value) = xattr::get(&path, &name)? {
				map.insert(name, String::from_utf8_lossy(&value).into_owned());
			}
		}
		Ok(map)
	})
	.await
}

/// Read one xattr of a path
pub async fn get_one(path: &Path, key: &str) -> Result<Option<String>, io::Error> {
	let path = path.to_owned();
	let key = key.to_owned();
	blocking(move || {
		Ok(xattr::get(&path, &key)?.map(|v| String::from_utf8_lossy(&v).into_owned()))
	})
	.await
}

/// Write a set of xattrs onto a path, leaving other keys in place
pub async fn set_all(path: &Path, map: &XattrMap) -> Result<(), io::Error> {
	let path = path.to_owned();
	let map = map.clone();
	blocking(move || {
		for (k, v) in map.iter() {
			xattr::set(&path, k, v.as_bytes())?;
		}
		Ok(())
	})
	.await
}

/// Remove one xattr; missing keys are not an error
pub async fn remove_one(path: &Path, key: &str) -> Result<(), io::Error> {
	let path = path.to_owned();
	let key = key.to_owned();
	blocking(move || match xattr::remove(&path, &key) {
		Ok(()) => Ok(()),
		Err(e) if e.raw_os_error() == Some(libc::ENODATA) => Ok(()),
		Err(e) => Err(e),
	})
	.await
}

/// Replace the whole `user.*` set of a path: existing `user.*` keys are
/// cleared first so stale metadata of an overwritten object cannot survive
pub async fn replace_all_user(path: &Path, new: &XattrMap) -> Result<(), io::Error> {
	let path = path.to_owned();
	let new = new.clone();
	blocking(move || {
		for name in xattr::list(&path)? {
			let name = match name.into_string() {
				Ok(n) => n,
				Err(_) => continue,
			};
			if name.starts_with(XATTR_USER_PREFIX) && !new.contains_key(&name) {
				match xattr::remove(&path, &name) {
					Ok(()) => (),
					Err(e) if e.raw_os_error() == Some(libc::ENODATA) => (),
					Err(e) => return Err(e),
				}
			}
		}
		for (k, v) in new.iter() {
			xattr::set(&path, k, v.as_bytes())?;
		}
		Ok(())
	})
	.await
}

/// Clear every `user.*` xattr of a path; used when a directory stops being
/// a directory object but still has children
pub async fn clear_all_user(path: &Path) -> Result<(), io::Error> {
	replace_all_user(path, &XattrMap::new()).await
}

async fn blocking<T, F>(f: F) -> Result<T, io::Error>
where
	F: FnOnce() -> Result<T, io::Error> + Send + 'static,
	T: Send + 'static,
{
	match tokio::task::spawn_blocking(f).await {
		Ok(res) => res,
		Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
	}
}

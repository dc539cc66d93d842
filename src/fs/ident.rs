//! File identity and version identifiers derived from stat

use std::fmt;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::str::FromStr;

use nsfs_util::data::{base36_decode, base36_encode};
use nsfs_util::error::Error;

/// Identity of an inode at a point in time, the unit of race detection in
/// the safe link/unlink primitives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileId {
	pub ino: u64,
	pub mtime_ns: u64,
}

impl FileId {
	pub fn of(meta: &Metadata) -> Self {
		Self {
			ino: meta.ino(),
			mtime_ns: mtime_ns_of(meta),
		}
	}
}

/// Modification time of a file in nanoseconds since the epoch
pub fn mtime_ns_of(meta: &Metadata) -> u64 {
	meta.mtime().max(0) as u64 * 1_000_000_000 + meta.mtime_nsec().max(0) as u64
}

/// A version identifier: the literal `null` for objects written while
/// versioning was suspended, or `mtime-<b36>-ino-<b36>` derived from the
/// version file's own stat. No other format is accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionId {
	Null,
	Stat { mtime_ns: u64, ino: u64 },
}

impl VersionId {
	pub fn of(meta: &Metadata) -> Self {
		let id = FileId::of(meta);
		VersionId::Stat {
			mtime_ns: id.mtime_ns,
			ino: id.ino,
		}
	}

	pub fn is_null(&self) -> bool {
		matches!(self, VersionId::Null)
	}

	/// The mtime embedded in the id; `null` versions carry none
	pub fn mtime_ns(&self) -> Option<u64> {
		match self {
			VersionId::Null => None,
			VersionId::Stat { mtime_ns, .. } => Some(*mtime_ns),
		}
	}
}

impl fmt::Display for VersionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			VersionId::Null => write!(f, "null"),
			VersionId::Stat { mtime_ns, ino } => write!(
				f,
				"mtime-{}-ino-{}",
				base36_encode(*mtime_ns),
				base36_encode(*ino)
			),
		}
	}
}

impl FromStr for VersionId {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Error> {
		if s == "null" {
			return Ok(VersionId::Null);
		}
		let malformed = || Error::bad_request(format!("malformed version id: {}", s));
		let rest = s.strip_prefix("mtime-").ok_or_else(malformed)?;
		let (mtime_part, ino_part) = rest.split_once("-ino-").ok_or_else(malformed)?;
		let mtime_ns = base36_decode(mtime_part).ok_or_else(malformed)?;
		let ino = base36_decode(ino_part).ok_or_else(malformed)?;
		Ok(VersionId::Stat { mtime_ns, ino })
	}
}

/// File name of a version of `basename` inside `.versions/`
pub fn version_file_name(basename: &str, vid: &VersionId) -> String {
	format!("{}_{}", basename, vid)
}

/// Split a `.versions/` entry name into its logical basename and version id.
/// Version ids contain no `_`, so the suffix starts at the last one.
pub fn split_version_name(name: &str) -> Option<(&str, VersionId)> {
	let (base, suffix) = name.rsplit_once('_')?;
	if base.is_empty() {
		return None;
	}
	let vid = suffix.parse().ok()?;
	Some((base, vid))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn version_id_roundtrip() {
		let vid = VersionId::Stat {
			mtime_ns: 1_700_000_000_123_456_789,
			ino: 42,
		};
		let s = vid.to_string();
		assert!(s.starts_with("mtime-"));
		assert!(s.contains("-ino-"));
		assert_eq!(s.parse::<VersionId>().unwrap(), vid);
		assert_eq!("null".parse::<VersionId>().unwrap(), VersionId::Null);
	}

	#[test]
	fn version_id_rejects_other_formats() {
		for bad in [
			"",
			"NULL",
			"mtime--ino-",
			"mtime-1x!-ino-2",
			"v123",
			"mtime-12",
			"mtime-12-ino-ABC",
		] {
			assert!(bad.parse::<VersionId>().is_err(), "accepted {:?}", bad);
		}
	}

	#[test]
	fn split_version_names() {
		let (base, vid) = split_version_name("my_key_mtime-abc-ino-12").unwrap();
		assert_eq!(base, "my_key");
		assert!(matches!(vid, VersionId::Stat { .. }));

		let (base, vid) = split_version_name("key_null").unwrap();
		assert_eq!(base, "key");
		assert!(vid.is_null());

		assert!(split_version_name("no-separator").is_none());
		assert!(split_version_name("key_notaversion").is_none());
		assert!(split_version_name("_null").is_none());
	}
}

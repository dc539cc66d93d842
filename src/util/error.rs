//! Module containing error types used in NSFS

use std::io;

use err_derive::Error;

/// Errors of this crate.
///
/// The first group of variants is the surfaced taxonomy: each of them maps to
/// a stable error code through [`Error::code`]. The second group is internal:
/// race sentinels consumed by retry loops and wrapped lower-level errors, all
/// surfaced as `INTERNAL_ERROR` if they escape.
#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "No such object")]
	NoSuchObject,

	#[error(display = "No such upload")]
	NoSuchUpload,

	#[error(display = "Unauthorized: {}", _0)]
	Unauthorized(String),

	#[error(display = "Bucket already exists")]
	BucketExists,

	#[error(display = "Bad request: {}", _0)]
	BadRequest(String),

	#[error(display = "Timed out waiting for an IO stream buffer")]
	StreamTimeout,

	#[error(display = "Server side encryption is not configured on this backend")]
	EncryptionUnsupported,

	#[error(display = "Directory is not empty")]
	NotEmpty,

	#[error(display = "Operation not supported: {}", _0)]
	Unsupported(&'static str),

	// ---- internal kinds ----
	#[error(display = "Concurrent writer race detected: {}", _0)]
	RaceDetected(String),

	#[error(display = "IO error: {}", _0)]
	Io(#[error(source)] io::Error),

	#[error(display = "JSON error: {}", _0)]
	Json(#[error(source)] serde_json::Error),

	#[error(display = "Invalid TOML: {}", _0)]
	TomlDecode(#[error(source)] toml::de::Error),

	#[error(display = "{}", _0)]
	Message(String),
}

impl Error {
	/// The stable code under which this error is surfaced to callers
	pub fn code(&self) -> &'static str {
		match self {
			Error::NoSuchObject => "NO_SUCH_OBJECT",
			Error::NoSuchUpload => "NO_SUCH_UPLOAD",
			Error::Unauthorized(_) => "UNAUTHORIZED",
			Error::BucketExists => "BUCKET_ALREADY_EXISTS",
			Error::BadRequest(_) => "BAD_REQUEST",
			Error::StreamTimeout => "IO_STREAM_ITEM_TIMEOUT",
			Error::EncryptionUnsupported => {
				"SERVER_SIDE_ENCRYPTION_CONFIGURATION_NOT_FOUND_ERROR"
			}
			Error::NotEmpty => "NOT_EMPTY",
			_ => "INTERNAL_ERROR",
		}
	}

	pub fn bad_request<M: Into<String>>(msg: M) -> Self {
		Error::BadRequest(msg.into())
	}

	pub fn unauthorized<M: Into<String>>(msg: M) -> Self {
		Error::Unauthorized(msg.into())
	}

	/// Strict retry predicate of the safe link/unlink loops: only an identity
	/// mismatch detected by a safe primitive is retryable. Everything else,
	/// including plain IO errors, propagates to the caller.
	pub fn is_retryable_race(&self) -> bool {
		matches!(self, Error::RaceDetected(_))
	}

	/// Translate an IO error from an operation on an object path
	pub fn for_object(e: io::Error) -> Self {
		match e.kind() {
			io::ErrorKind::NotFound => Error::NoSuchObject,
			io::ErrorKind::PermissionDenied => {
				Error::Unauthorized("access denied by filesystem".into())
			}
			_ => Error::Io(e),
		}
	}

	/// Translate an IO error from an operation on a multipart upload path
	pub fn for_upload(e: io::Error) -> Self {
		match e.kind() {
			io::ErrorKind::NotFound => Error::NoSuchUpload,
			io::ErrorKind::PermissionDenied => {
				Error::Unauthorized("access denied by filesystem".into())
			}
			_ => Error::Io(e),
		}
	}
}

/// Check whether an error wraps an IO error with the given raw OS errno
pub fn is_errno(err: &Error, code: i32) -> bool {
	match err {
		Error::Io(e) => e.raw_os_error() == Some(code),
		_ => false,
	}
}

/// Raw OS errno of an IO error, if it carries one
pub fn io_errno(err: &io::Error) -> Option<i32> {
	err.raw_os_error()
}

impl From<&str> for Error {
	fn from(v: &str) -> Error {
		Error::Message(v.to_string())
	}
}

impl From<String> for Error {
	fn from(v: String) -> Error {
		Error::Message(v)
	}
}

/// Trait to map any error type to `Error::Message`, attaching context
pub trait OkOrMessage {
	type S;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<Self::S, Error>;
}

impl<T, E> OkOrMessage for Result<T, E>
where
	E: std::fmt::Display,
{
	type S = T;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<T, Error> {
		match self {
			Ok(x) => Ok(x),
			Err(e) => Err(Error::Message(format!("{}: {}", message.into(), e))),
		}
	}
}

impl<T> OkOrMessage for Option<T> {
	type S = T;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<T, Error> {
		match self {
			Some(x) => Ok(x),
			None => Err(Error::Message(message.into())),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn surfaced_codes() {
		assert_eq!(Error::NoSuchObject.code(), "NO_SUCH_OBJECT");
		assert_eq!(Error::StreamTimeout.code(), "IO_STREAM_ITEM_TIMEOUT");
		assert_eq!(
			Error::Io(io::Error::new(io::ErrorKind::Other, "x")).code(),
			"INTERNAL_ERROR"
		);
	}

	#[test]
	fn errno_translation() {
		let e = Error::for_object(io::Error::from_raw_os_error(libc::ENOENT));
		assert!(matches!(e, Error::NoSuchObject));
		let e = Error::for_upload(io::Error::from_raw_os_error(libc::ENOENT));
		assert!(matches!(e, Error::NoSuchUpload));
		let e = Error::for_object(io::Error::from_raw_os_error(libc::EACCES));
		assert!(matches!(e, Error::Unauthorized(_)));
	}

	#[test]
	fn race_predicate() {
		assert!(Error::RaceDetected("x".into()).is_retryable_race());
		assert!(!Error::NoSuchObject.is_retryable_race());
	}
}

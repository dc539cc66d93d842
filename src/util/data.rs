//! Random identifiers and base36 helpers

use rand::prelude::*;

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a random 128 bit identifier, hex-encoded; used to name staging
/// files, multipart uploads and quarantine entries
pub fn gen_id_hex() -> String {
	let mut id = [0u8; 16];
	thread_rng().fill(&mut id[..]);
	hex::encode(id)
}

/// Encode an integer in lowercase base36 (`0-9a-z`)
pub fn base36_encode(mut n: u64) -> String {
	if n == 0 {
		return "0".to_string();
	}
	let mut out = Vec::with_capacity(13);
	while n > 0 {
		out.push(BASE36_DIGITS[(n % 36) as usize]);
		n /= 36;
	}
	out.reverse();
	String::from_utf8(out).expect("base36 digits are ascii")
}

/// Decode a lowercase base36 string; rejects empty strings, uppercase and
/// anything outside `0-9a-z`
pub fn base36_decode(s: &str) -> Option<u64> {
	if s.is_empty() {
		return None;
	}
	let mut n: u64 = 0;
	for c in s.bytes() {
		let d = match c {
			b'0'..=b'9' => c - b'0',
			b'a'..=b'z' => c - b'a' + 10,
			_ => return None,
		};
		n = n.checked_mul(36)?.checked_add(u64::from(d))?;
	}
	Some(n)
}

//! Shared pool of large IO buffers, bounded by a counting semaphore.
//!
//! Readers borrow one buffer per in-flight chunk; uploads reserve one slot
//! for their whole streaming phase so total IO memory stays under the
//! configured budget. Borrowing blocks under pressure and fails with a
//! stream timeout after the configured wait.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use nsfs_util::error::Error;

#[derive(Debug)]
pub struct BufferPool {
	sem: Arc<Semaphore>,
	free: Mutex<Vec<Vec<u8>>>,
	buf_size: usize,
	count: usize,
	timeout: Duration,
	warn_threshold: Duration,
}

/// A borrowed buffer; both the bytes and the pool slot go back on drop
#[derive(Debug)]
pub struct PooledBuf {
	buf: Option<Vec<u8>>,
	pool: Arc<BufferPool>,
	_permit: OwnedSemaphorePermit,
}

/// A reserved pool slot without a buffer, held around a whole upload
pub struct PoolSlot {
	_permit: OwnedSemaphorePermit,
}

impl BufferPool {
	pub fn new(
		mem_limit: usize,
		buf_size: usize,
		timeout: Duration,
		warn_threshold: Duration,
	) -> Arc<Self> {
		let count = std::cmp::max(1, mem_limit / buf_size);
		Arc::new(Self {
			sem: Arc::new(Semaphore::new(count)),
			free: Mutex::new(Vec::new()),
			buf_size,
			count,
			timeout,
			warn_threshold,
		})
	}

	pub fn buf_size(&self) -> usize {
		self.buf_size
	}

	/// Number of slots currently available
	pub fn available(&self) -> usize {
		self.sem.available_permits()
	}

	/// Total number of slots
	pub fn capacity(&self) -> usize {
		self.count
	}

	async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, Error> {
		let started = Instant::now();
		let permit = match tokio::time::timeout(self.timeout, self.sem.clone().acquire_owned()).await
		{
			Ok(Ok(permit)) => permit,
			Ok(Err(_)) => return Err(Error::Message("buffer pool semaphore closed".into())),
			Err(_) => {
				warn!(
					"buffer pool exhausted: no slot became available within {:?}",
					self.timeout
				);
				return Err(Error::StreamTimeout);
			}
		};
		let waited = started.elapsed();
		if waited >= self.warn_threshold {
			warn!("buffer pool under pressure: waited {:?} for a slot", waited);
		}
		Ok(permit)
	}

	/// Borrow one buffer from the pool
	pub async fn acquire(self: &Arc<Self>) -> Result<PooledBuf, Error> {
		let permit = self.acquire_permit().await?;
		let buf = self
			.free
			.lock()
			.unwrap()
			.pop()
			.unwrap_or_else(|| vec![0u8; self.buf_size]);
		Ok(PooledBuf {
			buf: Some(buf),
			pool: self.clone(),
			_permit: permit,
		})
	}

	/// Reserve one slot without taking a buffer
	pub async fn reserve(self: &Arc<Self>) -> Result<PoolSlot, Error> {
		let permit = self.acquire_permit().await?;
		Ok(PoolSlot { _permit: permit })
	}
}

impl PooledBuf {
	pub fn as_slice(&self) -> &[u8] {
		self.buf.as_ref().expect("buffer present until drop")
	}

	pub fn as_mut_slice(&mut self) -> &mut [u8] {
		self.buf.as_mut().expect("buffer present until drop")
	}

	pub fn len(&self) -> usize {
		self.as_slice().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl Drop for PooledBuf {
	fn drop(&mut self) {
		if let Some(buf) = self.buf.take() {
			self.pool.free.lock().unwrap().push(buf);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn acquire_and_reuse() {
		let pool = BufferPool::new(
			64 * 1024,
			32 * 1024,
			Duration::from_millis(50),
			Duration::from_millis(10),
		);
		assert_eq!(pool.capacity(), 2);

		let buf = pool.acquire().await.unwrap();
		assert_eq!(buf.len(), 32 * 1024);
		assert_eq!(pool.available(), 1);
		drop(buf);
		assert_eq!(pool.available(), 2);
	}

	#[tokio::test]
	async fn exhaustion_times_out() {
		let pool = BufferPool::new(
			1024,
			1024,
			Duration::from_millis(20),
			Duration::from_millis(5),
		);
		let held = pool.acquire().await.unwrap();

		let err = pool.acquire().await.unwrap_err();
		assert_eq!(err.code(), "IO_STREAM_ITEM_TIMEOUT");

		drop(held);
		let _ok = pool.acquire().await.unwrap();
	}

	#[tokio::test]
	async fn reserve_holds_a_slot() {
		let pool = BufferPool::new(
			1024,
			1024,
			Duration::from_millis(20),
			Duration::from_millis(5),
		);
		let slot = pool.reserve().await.unwrap();
		assert_eq!(pool.available(), 0);
		drop(slot);
		assert_eq!(pool.available(), 1);
	}
}

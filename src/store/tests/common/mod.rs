use std::path::Path;

use bytes::Bytes;
use futures::stream;

use nsfs_store::get::{read_object_stream, CollectSink, ReadParams};
use nsfs_store::put::upload_object;
use nsfs_store::*;
use nsfs_util::config::Config;
use nsfs_util::error::Error;

pub struct TestBucket {
	// keeps the scratch directory alive for the test's duration
	pub tmp: mktemp::Temp,
	pub store: Store,
	pub ctx: ReqCtx,
}

impl TestBucket {
	pub fn root(&self) -> &Path {
		self.tmp.as_ref()
	}
}

pub fn test_config() -> Config {
	let mut config = Config::default();
	// small buffers exercise chunk boundaries without big allocations
	config.buf_size = 64 * 1024;
	config.buf_pool_mem_limit = 16 * 64 * 1024;
	config
}

pub async fn open_bucket(versioning: VersioningMode) -> TestBucket {
	open_bucket_with(versioning, test_config()).await
}

pub async fn open_bucket_with(versioning: VersioningMode, config: Config) -> TestBucket {
	let tmp = mktemp::Temp::new_dir().unwrap();
	let root: &Path = tmp.as_ref();
	let shared = StoreShared::new(config);
	let store = Store::open(
		shared,
		StoreParams {
			bucket_root: root.to_path_buf(),
			bucket_id: "test-bucket".to_string(),
			versioning,
			access: AccessMode::ReadWrite,
			backend: BackendKind::Posix,
			force_md5: false,
		},
	)
	.await
	.unwrap();
	TestBucket {
		tmp,
		store,
		ctx: ReqCtx::default(),
	}
}

pub fn stream_of(data: Vec<u8>) -> ByteStream {
	Box::pin(stream::iter(vec![Ok(Bytes::from(data))]))
}

pub fn random_bytes(n: usize) -> Vec<u8> {
	use rand::RngCore;
	let mut buf = vec![0u8; n];
	rand::thread_rng().fill_bytes(&mut buf);
	buf
}

pub async fn put(bucket: &TestBucket, key: &str, data: Vec<u8>) -> UploadResult {
	let size = data.len() as u64;
	upload_object(
		&bucket.store,
		&bucket.ctx,
		UploadParams {
			key: key.to_string(),
			size: Some(size),
			..Default::default()
		},
		Some(stream_of(data)),
	)
	.await
	.unwrap()
}

pub async fn put_with(
	bucket: &TestBucket,
	params: UploadParams,
	data: Vec<u8>,
) -> Result<UploadResult, Error> {
	upload_object(&bucket.store, &bucket.ctx, params, Some(stream_of(data))).await
}

pub async fn read_range(
	bucket: &TestBucket,
	key: &str,
	start: Option<u64>,
	end: Option<u64>,
) -> Result<Vec<u8>, Error> {
	let mut sink = CollectSink::default();
	let params = ReadParams {
		key: key.to_string(),
		version_id: None,
		start,
		end,
	};
	read_object_stream(&bucket.store, &bucket.ctx, &params, &mut sink).await?;
	assert!(sink.finished);
	Ok(sink.data)
}

pub async fn read_all(bucket: &TestBucket, key: &str) -> Result<Vec<u8>, Error> {
	read_range(bucket, key, None, None).await
}

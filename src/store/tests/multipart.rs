use md5::{Digest, Md5};

use nsfs_fs::md::XattrMap;
use nsfs_store::multipart::{
	abort_object_upload, complete_object_upload, create_object_upload, list_multiparts,
	list_uploads, upload_multipart,
};
use nsfs_store::*;

use crate::common::*;

async fn start_upload(bucket: &TestBucket, key: &str) -> String {
	create_object_upload(
		&bucket.store,
		&bucket.ctx,
		key,
		Some("application/octet-stream".to_string()),
		XattrMap::new(),
	)
	.await
	.unwrap()
}

#[tokio::test]
async fn multipart_ten_parts() {
	let bucket = open_bucket(VersioningMode::Disabled).await;
	let obj_id = start_upload(&bucket, "mpu_key").await;

	let mut all_bytes = Vec::new();
	let mut parts = Vec::new();
	let mut md5_of_md5s = Md5::new();
	for num in 1..=10u32 {
		let data = random_bytes(1024 * 1024);
		all_bytes.extend_from_slice(&data);

		let mut part_md5 = Md5::new();
		part_md5.update(&data);
		let digest = part_md5.finalize();
		md5_of_md5s.update(digest);

		let etag = upload_multipart(&bucket.store, &bucket.ctx, &obj_id, num, stream_of(data))
			.await
			.unwrap();
		assert_eq!(etag, hex::encode(digest));
		parts.push(CompletePart { num, etag });
	}

	let listed = list_multiparts(&bucket.store, &obj_id).await.unwrap();
	assert_eq!(listed.len(), 10);
	assert!(listed.windows(2).all(|w| w[0].num < w[1].num));
	assert!(listed.iter().all(|p| p.size == 1024 * 1024));

	let expected_etag = format!("{}-10", hex::encode(md5_of_md5s.finalize()));
	let res = complete_object_upload(&bucket.store, &bucket.ctx, &obj_id, parts)
		.await
		.unwrap();
	assert_eq!(res.etag, expected_etag);
	assert_eq!(res.size, 10 * 1024 * 1024);

	let body = read_all(&bucket, "mpu_key").await.unwrap();
	assert_eq!(body, all_bytes);

	// the etag is also the object's stored md5
	let info = nsfs_store::get::read_object_md(&bucket.store, &bucket.ctx, "mpu_key", None)
		.await
		.unwrap();
	assert_eq!(info.etag, expected_etag);
}

#[tokio::test]
async fn completion_verifies_part_etags() {
	let bucket = open_bucket(VersioningMode::Disabled).await;
	let obj_id = start_upload(&bucket, "mpu_key").await;
	upload_multipart(
		&bucket.store,
		&bucket.ctx,
		&obj_id,
		1,
		stream_of(random_bytes(128)),
	)
	.await
	.unwrap();

	let err = complete_object_upload(
		&bucket.store,
		&bucket.ctx,
		&obj_id,
		vec![CompletePart {
			num: 1,
			etag: "00000000000000000000000000000000".to_string(),
		}],
	)
	.await
	.unwrap_err();
	assert_eq!(err.code(), "BAD_REQUEST");
}

#[tokio::test]
async fn completion_of_directory_key_creates_sentinel() {
	let bucket = open_bucket(VersioningMode::Disabled).await;
	let obj_id = start_upload(&bucket, "my_dir_mpu1/").await;
	let data = random_bytes(256);
	let etag = upload_multipart(
		&bucket.store,
		&bucket.ctx,
		&obj_id,
		1,
		stream_of(data.clone()),
	)
	.await
	.unwrap();
	complete_object_upload(
		&bucket.store,
		&bucket.ctx,
		&obj_id,
		vec![CompletePart { num: 1, etag }],
	)
	.await
	.unwrap();

	assert!(bucket.root().join("my_dir_mpu1/.folder").exists());
	assert_eq!(read_all(&bucket, "my_dir_mpu1/").await.unwrap(), data);
}

#[tokio::test]
async fn abort_drops_scratch_dir() {
	let bucket = open_bucket(VersioningMode::Disabled).await;
	let obj_id = start_upload(&bucket, "mpu_key").await;
	upload_multipart(
		&bucket.store,
		&bucket.ctx,
		&obj_id,
		1,
		stream_of(random_bytes(16)),
	)
	.await
	.unwrap();

	abort_object_upload(&bucket.store, &obj_id).await.unwrap();

	let err = list_multiparts(&bucket.store, &obj_id).await.unwrap_err();
	assert_eq!(err.code(), "NO_SUCH_UPLOAD");
	let err = abort_object_upload(&bucket.store, &obj_id)
		.await
		.unwrap_err();
	assert_eq!(err.code(), "NO_SUCH_UPLOAD");
}

#[tokio::test]
async fn unknown_upload_is_rejected() {
	let bucket = open_bucket(VersioningMode::Disabled).await;
	let err = upload_multipart(
		&bucket.store,
		&bucket.ctx,
		"deadbeef",
		1,
		stream_of(vec![1, 2, 3]),
	)
	.await
	.unwrap_err();
	assert_eq!(err.code(), "NO_SUCH_UPLOAD");
}

#[tokio::test]
async fn list_uploads_is_empty() {
	let bucket = open_bucket(VersioningMode::Disabled).await;
	let _obj_id = start_upload(&bucket, "mpu_key").await;
	let res = list_uploads(&bucket.store).await.unwrap();
	assert!(res.uploads.is_empty());
	assert!(!res.is_truncated);
}

use nsfs_store::list::{list_objects, list_object_versions};
use nsfs_store::*;

use crate::common::*;

async fn list(bucket: &TestBucket, params: ListParams) -> ListResult {
	list_objects(&bucket.store, &bucket.ctx, &params).await.unwrap()
}

fn keys(res: &ListResult) -> Vec<String> {
	res.objects.iter().map(|o| o.key.clone()).collect()
}

#[tokio::test]
async fn delimiter_collapses_to_common_prefixes() {
	let bucket = open_bucket(VersioningMode::Disabled).await;
	for key in [
		"a/b/c/upload_key_1/",
		"my_dir/",
		"my_dir_0_content/",
		"my_dir/my_dir2/",
	] {
		put(&bucket, key, vec![]).await;
	}
	for key in ["my_dir_mpu1/", "my_dir_mpu2/"] {
		let obj_id = nsfs_store::multipart::create_object_upload(
			&bucket.store,
			&bucket.ctx,
			key,
			None,
			Default::default(),
		)
		.await
		.unwrap();
		let etag = nsfs_store::multipart::upload_multipart(
			&bucket.store,
			&bucket.ctx,
			&obj_id,
			1,
			stream_of(random_bytes(8)),
		)
		.await
		.unwrap();
		nsfs_store::multipart::complete_object_upload(
			&bucket.store,
			&bucket.ctx,
			&obj_id,
			vec![CompletePart { num: 1, etag }],
		)
		.await
		.unwrap();
	}

	let res = list(
		&bucket,
		ListParams {
			delimiter: "/".to_string(),
			..Default::default()
		},
	)
	.await;
	assert_eq!(
		res.common_prefixes,
		vec![
			"a/",
			"my_dir/",
			"my_dir_0_content/",
			"my_dir_mpu1/",
			"my_dir_mpu2/",
		]
	);
	assert!(res.objects.is_empty());
	assert!(!res.is_truncated);
}

#[tokio::test]
async fn invalid_delimiter_is_rejected() {
	let bucket = open_bucket(VersioningMode::Disabled).await;
	let err = list_objects(
		&bucket.store,
		&bucket.ctx,
		&ListParams {
			delimiter: "#".to_string(),
			..Default::default()
		},
	)
	.await
	.unwrap_err();
	assert_eq!(err.code(), "BAD_REQUEST");
}

#[tokio::test]
async fn limit_zero_returns_empty() {
	let bucket = open_bucket(VersioningMode::Disabled).await;
	put(&bucket, "k", random_bytes(4)).await;
	let res = list(
		&bucket,
		ListParams {
			limit: Some(0),
			..Default::default()
		},
	)
	.await;
	assert!(res.objects.is_empty());
	assert!(!res.is_truncated);
	assert!(res.next_marker.is_none());
}

#[tokio::test]
async fn sorted_pagination_visits_every_key() {
	let bucket = open_bucket(VersioningMode::Disabled).await;
	let mut expected = Vec::new();
	for name in ["a/x", "a/y", "b", "c/d/e", "c/d/f", "g", "h"] {
		put(&bucket, name, random_bytes(4)).await;
		expected.push(name.to_string());
	}
	expected.sort();

	let mut seen = Vec::new();
	let mut marker = String::new();
	loop {
		let res = list(
			&bucket,
			ListParams {
				key_marker: marker.clone(),
				limit: Some(3),
				..Default::default()
			},
		)
		.await;
		// pages are sorted and bounded
		assert!(res.objects.len() <= 3);
		assert!(res
			.objects
			.windows(2)
			.all(|w| w[0].key < w[1].key));
		seen.extend(keys(&res));
		match res.next_marker {
			Some(next) if res.is_truncated => marker = next,
			_ => break,
		}
	}
	assert_eq!(seen, expected);
}

#[tokio::test]
async fn marker_inside_sibling_directory() {
	let bucket = open_bucket(VersioningMode::Disabled).await;
	for name in ["a/b", "a/y", "b"] {
		put(&bucket, name, random_bytes(4)).await;
	}
	// the marker points into a/, whose remaining children must still list
	let res = list(
		&bucket,
		ListParams {
			key_marker: "a/x".to_string(),
			..Default::default()
		},
	)
	.await;
	assert_eq!(keys(&res), vec!["a/y", "b"]);
}

#[tokio::test]
async fn prefix_narrows_the_walk() {
	let bucket = open_bucket(VersioningMode::Disabled).await;
	for name in ["a/b/c1", "a/b/c2", "a/other", "z"] {
		put(&bucket, name, random_bytes(4)).await;
	}
	let res = list(
		&bucket,
		ListParams {
			prefix: "a/b/c".to_string(),
			..Default::default()
		},
	)
	.await;
	assert_eq!(keys(&res), vec!["a/b/c1", "a/b/c2"]);
}

#[tokio::test]
async fn directory_object_listed_under_its_prefix() {
	let bucket = open_bucket(VersioningMode::Disabled).await;
	put(&bucket, "my_dir/", random_bytes(16)).await;
	put(&bucket, "my_dir/inner", random_bytes(4)).await;

	// without a delimiter the directory object appears as its own key
	let res = list(
		&bucket,
		ListParams {
			prefix: "my_dir/".to_string(),
			..Default::default()
		},
	)
	.await;
	assert_eq!(keys(&res), vec!["my_dir/", "my_dir/inner"]);
	let dir_obj = &res.objects[0];
	assert_eq!(dir_obj.size, 16);

	// with a delimiter the exact-prefix directory object still lists
	let res = list(
		&bucket,
		ListParams {
			prefix: "my_dir/".to_string(),
			delimiter: "/".to_string(),
			..Default::default()
		},
	)
	.await;
	assert_eq!(keys(&res), vec!["my_dir/", "my_dir/inner"]);
}

#[tokio::test]
async fn folder_sentinel_never_listed() {
	let bucket = open_bucket(VersioningMode::Disabled).await;
	put(&bucket, "my_dir/", random_bytes(16)).await;
	let res = list(&bucket, ListParams::default()).await;
	assert!(keys(&res).iter().all(|k| !k.contains(".folder")));
}

#[tokio::test]
async fn streaming_fallback_matches_cached_listing() {
	// a zero cap forces every directory onto the streaming path
	let mut config = test_config();
	config.dir_cache_max_dir_size = 0;
	let bucket = open_bucket_with(VersioningMode::Disabled, config).await;

	for name in ["a/x", "b", "c", "d/e"] {
		put(&bucket, name, random_bytes(4)).await;
	}
	let res = list(&bucket, ListParams::default()).await;
	assert_eq!(keys(&res), vec!["a/x", "b", "c", "d/e"]);

	let res = list(
		&bucket,
		ListParams {
			key_marker: "b".to_string(),
			..Default::default()
		},
	)
	.await;
	assert_eq!(keys(&res), vec!["c", "d/e"]);
}

#[tokio::test]
async fn version_listing_paginates_with_version_markers() {
	let bucket = open_bucket(VersioningMode::Enabled).await;
	put(&bucket, "key", random_bytes(1)).await;
	put(&bucket, "key", random_bytes(2)).await;
	put(&bucket, "key", random_bytes(3)).await;
	put(&bucket, "other", random_bytes(4)).await;

	let mut seen = Vec::new();
	let mut params = ListParams {
		limit: Some(1),
		..Default::default()
	};
	loop {
		let res = list_object_versions(&bucket.store, &bucket.ctx, &params)
			.await
			.unwrap();
		for obj in &res.objects {
			seen.push((obj.key.clone(), obj.version_id.unwrap().to_string()));
		}
		if !res.is_truncated {
			break;
		}
		params.key_marker = res.next_marker.clone().unwrap();
		params.version_id_marker = res.next_version_id_marker.clone();
	}

	// three versions of "key" newest first, then "other"
	assert_eq!(seen.len(), 4);
	assert!(seen[..3].iter().all(|(k, _)| k == "key"));
	assert_eq!(seen[3].0, "other");
	// no duplicates across pages
	let mut uniq = seen.clone();
	uniq.sort();
	uniq.dedup();
	assert_eq!(uniq.len(), 4);
}

//! Manifest pipeline end to end: cold pull, warm pull, degradation when
//! the origin is down, and digest-mismatch rejection.

mod common;

use common::*;

const INDEX_TYPE: &str = "application/vnd.oci.image.index.v1+json";

fn index_body() -> Vec<u8> {
    format!(
        r#"{{"schemaVersion":2,"mediaType":"{}","manifests":[]}}"#,
        INDEX_TYPE
    )
    .into_bytes()
}

#[tokio::test]
async fn cold_tag_pull_caches_links_and_body() {
    let origin = Origin::start().await;
    let body = index_body();
    let digest = sha256_hex(&body);
    origin.set(
        "/v2/library/busybox/manifests/1",
        ScriptedResponse::ok(&body).with_content_type(INDEX_TYPE),
    );

    let proxy = ProxyBuilder::against(&origin.host).start().await;
    let client = reqwest::Client::new();

    let response = client
        .get(proxy.url(&format!("/v2/{}/library/busybox/manifests/1", origin.host)))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("docker-content-digest")
            .unwrap()
            .to_str()
            .unwrap(),
        format!("sha256:{}", digest)
    );
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        INDEX_TYPE
    );
    assert_eq!(response.bytes().await.unwrap(), body);

    // Tag link, revision link, and body all landed in the shared layout.
    let tag_link = proxy.storage_file(&tag_link_key(&origin.host, "library/busybox", "1"));
    assert_eq!(
        std::fs::read_to_string(tag_link).unwrap(),
        format!("sha256:{}", digest)
    );
    let revision_link =
        proxy.storage_file(&revision_link_key(&origin.host, "library/busybox", &digest));
    assert_eq!(
        std::fs::read_to_string(revision_link).unwrap(),
        format!("sha256:{}", digest)
    );
    assert_eq!(
        std::fs::read(proxy.storage_file(&blob_storage_key(&digest))).unwrap(),
        body
    );
}

#[tokio::test]
async fn warm_tag_pull_skips_the_origin() {
    let origin = Origin::start().await;
    let body = index_body();
    origin.set(
        "/v2/library/busybox/manifests/1",
        ScriptedResponse::ok(&body).with_content_type(INDEX_TYPE),
    );

    let proxy = ProxyBuilder::against(&origin.host).start().await;
    let client = reqwest::Client::new();
    let url = proxy.url(&format!("/v2/{}/library/busybox/manifests/1", origin.host));

    let first = client.get(&url).send().await.unwrap();
    assert_eq!(first.status(), 200);
    let first_body = first.bytes().await.unwrap();
    assert_eq!(origin.hits("GET /v2/library/busybox/manifests/1"), 1);

    // Within the freshness window: served from cache, no origin call.
    let second = client.get(&url).send().await.unwrap();
    assert_eq!(second.status(), 200);
    assert!(second.headers().contains_key("docker-content-digest"));
    assert_eq!(second.bytes().await.unwrap(), first_body);
    assert_eq!(origin.hits("GET /v2/library/busybox/manifests/1"), 1);
}

#[tokio::test]
async fn degraded_tag_pull_serves_cached_body() {
    let origin = Origin::start().await;
    let body = index_body();
    origin.set(
        "/v2/library/busybox/manifests/1",
        ScriptedResponse::ok(&body).with_content_type(INDEX_TYPE),
    );

    let proxy = ProxyBuilder::against(&origin.host).start().await;
    let client = reqwest::Client::new();
    let path = format!("/v2/{}/library/busybox/manifests/1", origin.host);

    assert_eq!(client.get(proxy.url(&path)).send().await.unwrap().status(), 200);

    // New proxy instance over the same storage: the freshness map is cold,
    // so the origin is consulted again; it now fails.
    origin.set(
        "/v2/library/busybox/manifests/1",
        ScriptedResponse::ok(b"oops").with_status(500),
    );
    let degraded = ProxyBuilder::against(&origin.host)
        .storage(proxy.storage)
        .start()
        .await;

    let response = client.get(degraded.url(&path)).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap(), body);
}

#[tokio::test]
async fn missing_cache_surfaces_origin_error() {
    let origin = Origin::start().await;
    origin.set(
        "/v2/library/busybox/manifests/1",
        ScriptedResponse::ok(b"{}").with_status(503),
    );

    let proxy = ProxyBuilder::against(&origin.host).start().await;
    let client = reqwest::Client::new();

    let response = client
        .get(proxy.url(&format!("/v2/{}/library/busybox/manifests/1", origin.host)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn digest_mismatch_is_rejected_and_not_cached() {
    let origin = Origin::start().await;
    let body = index_body();
    let requested = "deadbeef".repeat(8);
    assert_ne!(sha256_hex(&body), requested);

    let path = format!("/v2/library/busybox/manifests/sha256:{}", requested);
    origin.set(&path, ScriptedResponse::ok(&body).with_content_type(INDEX_TYPE));

    let proxy = ProxyBuilder::against(&origin.host).start().await;
    let client = reqwest::Client::new();

    let response = client
        .get(proxy.url(&format!(
            "/v2/{}/library/busybox/manifests/sha256:{}",
            origin.host, requested
        )))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);

    // Neither a link nor a body appeared under the requested digest.
    assert!(!proxy
        .storage_file(&revision_link_key(&origin.host, "library/busybox", &requested))
        .exists());
    assert!(!proxy.storage_file(&blob_storage_key(&requested)).exists());
}

#[tokio::test]
async fn digest_pull_is_immutable_and_never_refetched() {
    let origin = Origin::start().await;
    let body = index_body();
    let digest = sha256_hex(&body);

    let origin_path = format!("/v2/library/busybox/manifests/sha256:{}", digest);
    origin.set(
        &origin_path,
        ScriptedResponse::ok(&body).with_content_type(INDEX_TYPE),
    );

    let proxy = ProxyBuilder::against(&origin.host).start().await;
    let client = reqwest::Client::new();
    let url = proxy.url(&format!(
        "/v2/{}/library/busybox/manifests/sha256:{}",
        origin.host, digest
    ));

    assert_eq!(client.get(&url).send().await.unwrap().status(), 200);
    assert_eq!(origin.hits(&format!("GET {}", origin_path)), 1);

    // Digest refs are served from cache without any TTL gate.
    for _ in 0..3 {
        let response = client.get(&url).send().await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.bytes().await.unwrap(), body);
    }
    assert_eq!(origin.hits(&format!("GET {}", origin_path)), 1);
}

#[tokio::test]
async fn head_returns_headers_without_body() {
    let origin = Origin::start().await;
    let body = index_body();
    origin.set(
        "/v2/library/busybox/manifests/1",
        ScriptedResponse::ok(&body).with_content_type(INDEX_TYPE),
    );

    let proxy = ProxyBuilder::against(&origin.host).start().await;
    let client = reqwest::Client::new();
    let url = proxy.url(&format!("/v2/{}/library/busybox/manifests/1", origin.host));

    // Warm the cache, then HEAD against it.
    assert_eq!(client.get(&url).send().await.unwrap().status(), 200);

    let response = client.head(&url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-length")
            .unwrap()
            .to_str()
            .unwrap(),
        body.len().to_string()
    );
    assert!(response.headers().contains_key("docker-content-digest"));
    assert_eq!(response.bytes().await.unwrap().len(), 0);
}

//! Blob agent end to end: dedup of concurrent cold pulls, redirect
//! thresholds, range reads, and negative caching of upstream denials.

mod common;

use common::*;
use futures::future::join_all;
use pullgate::config::AgentConfig;

fn blob_bytes() -> Vec<u8> {
    (0u32..16 * 1024).flat_map(|i| i.to_le_bytes()).collect()
}

#[tokio::test]
async fn fifty_concurrent_pulls_issue_one_origin_fetch() {
    let origin = Origin::start().await;
    let body = blob_bytes();
    let digest = sha256_hex(&body);
    let origin_path = format!("/v2/library/busybox/blobs/sha256:{}", digest);
    origin.set(
        &origin_path,
        ScriptedResponse::ok(&body).with_delay_ms(200),
    );

    let proxy = ProxyBuilder::against(&origin.host).start().await;
    let client = reqwest::Client::new();
    let url = proxy.url(&format!(
        "/v2/{}/library/busybox/blobs/sha256:{}",
        origin.host, digest
    ));

    let requests = (0..50).map(|_| {
        let client = client.clone();
        let url = url.clone();
        async move {
            let response = client.get(&url).send().await.unwrap();
            let status = response.status();
            let bytes = response.bytes().await.unwrap();
            (status, bytes)
        }
    });

    let results = join_all(requests).await;
    for (status, bytes) in &results {
        assert_eq!(*status, 200);
        assert_eq!(bytes.as_ref(), body.as_slice());
    }

    assert_eq!(origin.hits(&format!("GET {}", origin_path)), 1);

    let stored = std::fs::read(proxy.storage_file(&blob_storage_key(&digest))).unwrap();
    assert_eq!(stored, body);
}

#[tokio::test]
async fn large_blobs_redirect_to_signed_urls() {
    let origin = Origin::start().await;
    let body = blob_bytes();
    let digest = sha256_hex(&body);
    origin.set(
        &format!("/v2/library/busybox/blobs/sha256:{}", digest),
        ScriptedResponse::ok(&body),
    );

    let proxy = ProxyBuilder::against(&origin.host)
        .redirect_base("http://cdn.test/objects/")
        .agent_config(AgentConfig {
            no_redirect_size: 1024,
            ..AgentConfig::default()
        })
        .start()
        .await;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    let response = client
        .get(proxy.url(&format!(
            "/v2/{}/library/busybox/blobs/sha256:{}",
            origin.host, digest
        )))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 307);
    let location = response
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(location.starts_with("http://cdn.test/objects/docker/registry/v2/blobs/sha256/"));
    assert!(location.contains("expires="));
    assert!(location.contains("sig="));
    assert_eq!(response.bytes().await.unwrap().len(), 0);
}

#[tokio::test]
async fn always_redirect_tokens_redirect_small_blobs() {
    let origin = Origin::start().await;
    let body = b"tiny layer".to_vec();
    let digest = sha256_hex(&body);
    origin.set(
        &format!("/v2/library/busybox/blobs/sha256:{}", digest),
        ScriptedResponse::ok(&body),
    );

    let key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
    let encoder =
        pullgate::token::Encoder::new(pullgate::token::Signer::new(key.clone()));
    let proxy = ProxyBuilder::against(&origin.host)
        .redirect_base("http://cdn.test/objects/")
        .auth_key(key)
        .start()
        .await;

    let token = pullgate::token::Token {
        expires_at: Some(chrono::Utc::now() + chrono::Duration::minutes(5)),
        scope: "repository:library/busybox:pull".to_string(),
        attribute: pullgate::token::Attribute {
            always_redirect: true,
            no_rate_limit: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let code = encoder.encode(&token).unwrap();

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let response = client
        .get(proxy.url(&format!(
            "/v2/{}/library/busybox/blobs/sha256:{}",
            origin.host, digest
        )))
        .bearer_auth(code)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 307);
}

#[tokio::test]
async fn head_reports_size_without_body() {
    let origin = Origin::start().await;
    let body = blob_bytes();
    let digest = sha256_hex(&body);
    origin.set(
        &format!("/v2/library/busybox/blobs/sha256:{}", digest),
        ScriptedResponse::ok(&body),
    );

    let proxy = ProxyBuilder::against(&origin.host).start().await;
    let client = reqwest::Client::new();
    let url = proxy.url(&format!(
        "/v2/{}/library/busybox/blobs/sha256:{}",
        origin.host, digest
    ));

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
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/octet-stream"
    );
}

#[tokio::test]
async fn range_reads_reopen_at_the_offset() {
    let origin = Origin::start().await;
    let body = blob_bytes();
    let digest = sha256_hex(&body);
    origin.set(
        &format!("/v2/library/busybox/blobs/sha256:{}", digest),
        ScriptedResponse::ok(&body),
    );

    let proxy = ProxyBuilder::against(&origin.host).start().await;
    let client = reqwest::Client::new();
    let url = proxy.url(&format!(
        "/v2/{}/library/busybox/blobs/sha256:{}",
        origin.host, digest
    ));

    // Warm the cache first.
    assert_eq!(client.get(&url).send().await.unwrap().status(), 200);

    let response = client
        .get(&url)
        .header("Range", "bytes=8-23")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 206);
    assert_eq!(
        response
            .headers()
            .get("content-range")
            .unwrap()
            .to_str()
            .unwrap(),
        format!("bytes 8-23/{}", body.len())
    );
    assert_eq!(response.bytes().await.unwrap().as_ref(), &body[8..24]);
}

#[tokio::test]
async fn upstream_denial_is_negative_cached() {
    let origin = Origin::start().await;
    let digest = sha256_hex(b"never fetched");
    let origin_path = format!("/v2/library/busybox/blobs/sha256:{}", digest);
    origin.set(&origin_path, ScriptedResponse::ok(b"").with_status(401));

    let proxy = ProxyBuilder::against(&origin.host).start().await;
    let client = reqwest::Client::new();
    let url = proxy.url(&format!(
        "/v2/{}/library/busybox/blobs/sha256:{}",
        origin.host, digest
    ));

    let first = client.get(&url).send().await.unwrap();
    assert_eq!(first.status(), 403);
    let body: serde_json::Value = first.json().await.unwrap();
    assert_eq!(body["errors"][0]["code"], "DENIED");

    // Repeat requests are answered from the negative cache.
    let hits_after_first = origin.hits(&format!("GET {}", origin_path));
    for _ in 0..3 {
        assert_eq!(client.get(&url).send().await.unwrap().status(), 403);
    }
    assert_eq!(origin.hits(&format!("GET {}", origin_path)), hits_after_first);
}

#[tokio::test]
async fn structured_upstream_errors_pass_through() {
    let origin = Origin::start().await;
    let digest = sha256_hex(b"quota");
    origin.set(
        &format!("/v2/library/busybox/blobs/sha256:{}", digest),
        ScriptedResponse::ok(
            br#"{"errors":[{"code":"TOOMANYREQUESTS","message":"pull quota exhausted"}]}"#,
        )
        .with_status(429)
        .with_content_type("application/json"),
    );

    let proxy = ProxyBuilder::against(&origin.host).start().await;
    let client = reqwest::Client::new();

    let response = client
        .get(proxy.url(&format!(
            "/v2/{}/library/busybox/blobs/sha256:{}",
            origin.host, digest
        )))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["errors"][0]["code"], "TOOMANYREQUESTS");
    assert_eq!(body["errors"][0]["message"], "pull quota exhausted");
}

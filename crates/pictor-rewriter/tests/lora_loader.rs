//! LoRA resolution against a mock bucket

use pictor_core::{CancelAction, CancellationController, GenerationConfiguration, LoRA, ModelStore};
use pictor_network::{ObjectStoreClient, ObjectStoreConfig, RetryConfig};
use pictor_rewriter::{ConfigurationRewriter, DownloadProgress, LoraLoader, RewriteError};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WEIGHTS: &[u8] = b"lora weights";

fn weights_hash() -> String {
    hex::encode(Sha256::digest(WEIGHTS))
}

fn loader(server: &MockServer, dir: &TempDir) -> LoraLoader {
    let config = ObjectStoreConfig::new(server.uri(), "loras", "access", "secret").with_retry(
        RetryConfig {
            max_retries: 1,
            backoff: Duration::from_millis(10),
        },
    );
    LoraLoader::new(
        ObjectStoreClient::new(config).unwrap(),
        ModelStore::new(dir.path()),
    )
}

fn no_cancel() -> impl Fn(CancelAction) + Send + Sync + 'static {
    |_action: CancelAction| {}
}

#[tokio::test]
async fn test_downloads_missing_lora_and_canonicalizes() {
    let server = MockServer::start().await;
    let hash = weights_hash();
    let remote = format!("{}_d71b5bbc-0a6b-4b50-8c6f-3691b80bc2ee", hash);

    Mock::given(method("GET"))
        .and(path(format!("/loras/{}", remote)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(WEIGHTS.to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let loader = loader(&server, &dir);
    let configuration = GenerationConfiguration::default()
        .with_lora(LoRA::new(remote.clone(), 0.8))
        .with_lora(LoRA::new("detail_tweaker", 0.3));

    let mut updates: Vec<DownloadProgress> = Vec::new();
    let rewritten = loader
        .rewrite(&configuration, &mut |p| updates.push(p), &no_cancel())
        .await
        .unwrap();

    assert_eq!(
        rewritten.loras,
        vec![LoRA::new(hash.clone(), 0.8), LoRA::new("detail_tweaker", 0.3)]
    );
    assert_eq!(std::fs::read(dir.path().join(&hash)).unwrap(), WEIGHTS);

    let last = updates.last().unwrap();
    assert_eq!(last.index, 0);
    assert_eq!(last.total, 1);
    assert_eq!(last.bytes_received, WEIGHTS.len() as u64);

    // Already resolved: nothing more to fetch.
    let again = loader
        .rewrite(&configuration, &mut |_| {}, &no_cancel())
        .await
        .unwrap();
    assert_eq!(again, rewritten);
    let twice = loader
        .rewrite(&rewritten, &mut |_| {}, &no_cancel())
        .await
        .unwrap();
    assert_eq!(twice, rewritten);
}

#[tokio::test]
async fn test_present_and_plain_names_never_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let hash = weights_hash();
    std::fs::write(dir.path().join(&hash), WEIGHTS).unwrap();

    let configuration = GenerationConfiguration::default()
        .with_lora(LoRA::new(format!("{}_suffix", hash), 1.0))
        .with_lora(LoRA::new("my_custom_model.ckpt", 1.0));

    let loader = loader(&server, &dir);
    assert!(loader.missing_assets(&configuration).is_empty());

    let rewritten = loader
        .rewrite(&configuration, &mut |_| {}, &no_cancel())
        .await
        .unwrap();
    assert_eq!(rewritten.lora_files(), vec![hash.as_str(), "my_custom_model.ckpt"]);
}

#[tokio::test]
async fn test_missing_asset_fails_with_its_name() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/loras"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<ListBucketResult/>"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let name = format!("{}_gone", "ab".repeat(32));
    let configuration = GenerationConfiguration::default().with_lora(LoRA::new(name.clone(), 1.0));

    let err = loader(&server, &dir)
        .rewrite(&configuration, &mut |_| {}, &no_cancel())
        .await
        .unwrap_err();
    match err {
        RewriteError::CannotLoadModel(failed) => assert_eq!(failed, name),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_corrupted_download_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let hash = weights_hash();
    let configuration =
        GenerationConfiguration::default().with_lora(LoRA::new(format!("{}_x", hash), 1.0));

    let err = loader(&server, &dir)
        .rewrite(&configuration, &mut |_| {}, &no_cancel())
        .await
        .unwrap_err();
    assert!(matches!(err, RewriteError::CannotLoadModel(_)));
    assert!(!dir.path().join(&hash).exists());
}

#[tokio::test]
async fn test_alternative_key_fallback() {
    let server = MockServer::start().await;
    let hash = weights_hash();
    let requested = format!("{}_old", hash);
    let alternative = format!("{}_new", hash);

    Mock::given(method("GET"))
        .and(path("/loras"))
        .and(query_param("prefix", hash.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "<ListBucketResult><Contents><Key>{}</Key></Contents>\
             <Contents><Key>{}</Key></Contents></ListBucketResult>",
            requested, alternative
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/loras/{}", alternative)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(WEIGHTS.to_vec()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/loras/{}", requested)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let configuration = GenerationConfiguration::default().with_lora(LoRA::new(requested, 1.0));
    let rewritten = loader(&server, &dir)
        .rewrite(&configuration, &mut |_| {}, &no_cancel())
        .await
        .unwrap();

    assert_eq!(rewritten.lora_files(), vec![hash.as_str()]);
    assert!(dir.path().join(&hash).exists());
}

#[tokio::test]
async fn test_cancelled_request_aborts_download() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(WEIGHTS.to_vec())
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let controller = CancellationController::with_monitor("rewrite", None);
    let registrar = {
        let controller = controller.clone();
        move |action: CancelAction| controller.register(action)
    };

    let canceller = controller.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let configuration = GenerationConfiguration::default()
        .with_lora(LoRA::new(format!("{}_slow", weights_hash()), 1.0));
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        loader(&server, &dir).rewrite(&configuration, &mut |_| {}, &registrar),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert!(matches!(err, RewriteError::Cancelled));
    assert!(!dir.path().join(weights_hash()).exists());
}

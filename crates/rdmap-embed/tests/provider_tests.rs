use axum::{http::HeaderMap, http::StatusCode, routing::post, Json, Router};
use serde_json::{json, Value};
use std::time::Duration;

use rdmap_core::config::{EmbeddingProvider, EmbeddingSettings};
use rdmap_core::error::Error;
use rdmap_core::traits::Embedder;
use rdmap_embed::{build_embedder, RemoteEmbedder};

async fn embeddings(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer test-key") {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "no"})));
    }
    let inputs = body["input"].as_array().cloned().unwrap_or_default();
    if inputs.iter().any(|t| t.as_str() == Some("boom")) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "boom"})));
    }
    // Returned out of order; the client must sort by index.
    let data: Vec<Value> = inputs
        .iter()
        .enumerate()
        .rev()
        .map(|(i, t)| {
            let len = t.as_str().map_or(0, |s| s.chars().count()) as f32;
            json!({"index": i, "embedding": [len, 1.0, 0.0]})
        })
        .collect();
    (StatusCode::OK, Json(json!({"data": data})))
}

async fn spawn_provider() -> String {
    let app = Router::new().route("/v1/embeddings", post(embeddings));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/v1")
}

#[tokio::test]
async fn remote_embedder_orders_by_index_and_skips_blank_texts() {
    let base = spawn_provider().await;
    let embedder = RemoteEmbedder::new(&base, "m", "test-key", 3, Duration::from_secs(5)).unwrap();

    let texts = vec!["ab".to_string(), "  ".to_string(), "abcd".to_string()];
    let out = embedder.embed_batch(&texts).await.unwrap();
    assert_eq!(out, vec![vec![2.0, 1.0, 0.0], vec![0.0, 0.0, 0.0], vec![4.0, 1.0, 0.0]]);
    assert_eq!(embedder.embedder_id(), "remote:m");
}

#[tokio::test]
async fn remote_embedder_maps_http_errors_to_embedding_failed() {
    let base = spawn_provider().await;
    let embedder = RemoteEmbedder::new(&base, "m", "test-key", 3, Duration::from_secs(5)).unwrap();
    let err = embedder.embed("boom").await.unwrap_err();
    assert!(matches!(err, Error::EmbeddingFailed(_)), "got {err:?}");

    let wrong_key = RemoteEmbedder::new(&base, "m", "other", 3, Duration::from_secs(5)).unwrap();
    assert!(matches!(wrong_key.embed("x").await, Err(Error::EmbeddingFailed(_))));
}

#[tokio::test]
async fn remote_embedder_rejects_dimension_mismatch() {
    let base = spawn_provider().await;
    let embedder = RemoteEmbedder::new(&base, "m", "test-key", 5, Duration::from_secs(5)).unwrap();
    assert!(matches!(embedder.embed("abc").await, Err(Error::EmbeddingFailed(_))));
}

#[test]
fn remote_provider_requires_api_key() {
    let settings = EmbeddingSettings {
        provider: EmbeddingProvider::Remote,
        api_key: None,
        ..EmbeddingSettings::default()
    };
    assert!(matches!(build_embedder(&settings), Err(Error::InvalidConfig(_))));
}

#[cfg(not(feature = "local-model"))]
#[test]
fn local_provider_needs_feature() {
    let settings = EmbeddingSettings {
        provider: EmbeddingProvider::Local,
        ..EmbeddingSettings::default()
    };
    assert!(matches!(build_embedder(&settings), Err(Error::InvalidConfig(_))));
}

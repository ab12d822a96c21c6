use axum::{http::HeaderMap, http::StatusCode, routing::post, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use rdmap_core::config::{LlmSettings, RerankMode, Settings};
use rdmap_core::error::Error;
use rdmap_core::traits::{QueryRewriter, Reranker};
use rdmap_core::types::SearchRequest;
use rdmap_core::vector::normalized;
use rdmap_embed::MockEmbedder;
use rdmap_search::{build_pipeline, ChatClient, LlmReranker, LlmRewriter, ServiceState};
use rdmap_vector::{MetadataStore, SearchTextStore, VectorIndex};

async fn chat(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer chat-key") {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "no"})));
    }
    let model = body["model"].as_str().unwrap_or_default();
    let user = body["messages"][1]["content"].as_str().unwrap_or_default();
    let content = match model {
        "rewrite-ok" => format!("\"{}\"", user.trim_start_matches("Query: ").to_uppercase()),
        "rank-ok" => {
            r#"Here you go: {"ranking": [{"index": 3, "reason": "про биологию"}, {"index": 3}, {"index": 7}]}"#
                .to_string()
        }
        "rank-garbage" => "I cannot rank these.".to_string(),
        _ => return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "boom"}))),
    };
    (StatusCode::OK, Json(json!({"choices": [{"message": {"role": "assistant", "content": content}}]})))
}

async fn spawn_chat() -> String {
    let app = Router::new().route("/v1/chat/completions", post(chat));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/v1")
}

fn client(base: &str) -> ChatClient {
    ChatClient::new(base, "chat-key", Duration::from_secs(5)).unwrap()
}

fn state() -> ServiceState {
    let vectors = vec![
        normalized(vec![1.0, 0.0]),
        normalized(vec![0.9, 0.1]),
        normalized(vec![0.5, 0.5]),
    ];
    let index = VectorIndex::build(2, "mock", &vectors).unwrap();
    let mut meta = String::new();
    let mut text = String::new();
    for id in ["P1", "P2", "P3"] {
        meta.push_str(&format!(
            "{{\"project_id\":\"{id}\",\"center_id\":\"C\",\"center_name\":\"НИЦ\",\"title\":\"Проект {id}\",\"year\":\"2024\"}}\n"
        ));
        text.push_str(&format!("{{\"project_id\":\"{id}\",\"search_text\":\"текст {id}\"}}\n"));
    }
    ServiceState::new(
        index,
        MetadataStore::from_bytes(meta.into_bytes()),
        Some(SearchTextStore::from_bytes(text.into_bytes())),
        "llm",
        0,
    )
    .unwrap()
}

fn embedder() -> Arc<MockEmbedder> {
    Arc::new(MockEmbedder::returning(vec![1.0, 0.0]))
}

#[tokio::test]
async fn rewriter_cleans_model_reply() {
    let base = spawn_chat().await;
    let rewriter = LlmRewriter::new(client(&base), "rewrite-ok");
    assert_eq!(rewriter.rewrite("laser").await.unwrap(), "LASER");

    let broken = LlmRewriter::new(client(&base), "down");
    assert!(matches!(broken.rewrite("laser").await, Err(Error::RewriteFailed(_))));
}

#[tokio::test]
async fn llm_reranker_puts_ranked_first_and_keeps_the_rest_in_order() {
    let base = spawn_chat().await;
    let pipeline = rdmap_search::SearchPipeline::new(embedder())
        .with_reranker(Arc::new(LlmReranker::new(client(&base), "rank-ok")) as Arc<dyn Reranker>);

    let resp = pipeline
        .search(&state(), &SearchRequest::new("био").with_top_k(3, 2).with_rewrite(false))
        .await
        .unwrap();
    let ids: Vec<_> = resp.results.iter().map(|r| r.project_id.as_str()).collect();
    assert_eq!(ids, vec!["P3", "P1"]);
    assert_eq!(resp.results[0].why_matched.as_deref(), Some("про биологию"));
    assert!(resp.results[1].why_matched.is_none());
    assert!(resp.timings_ms.contains_key("rerank"));
}

#[tokio::test]
async fn unusable_ranking_falls_back_to_retrieval_order() {
    let base = spawn_chat().await;
    for model in ["rank-garbage", "down"] {
        let pipeline = rdmap_search::SearchPipeline::new(embedder())
            .with_reranker(Arc::new(LlmReranker::new(client(&base), model)) as Arc<dyn Reranker>);
        let resp = pipeline
            .search(&state(), &SearchRequest::new("био").with_top_k(3, 2))
            .await
            .unwrap();
        let ids: Vec<_> = resp.results.iter().map(|r| r.project_id.as_str()).collect();
        assert_eq!(ids, vec!["P1", "P2"], "model {model}");
    }
}

#[tokio::test]
async fn pipeline_from_settings_wires_llm_stages_only_with_a_key() {
    let base = spawn_chat().await;
    let mut settings = Settings::default();
    settings.llm = LlmSettings {
        enabled: true,
        base_url: base,
        api_key: Some("chat-key".into()),
        rewrite_model: "rewrite-ok".into(),
        rerank_model: "rank-ok".into(),
        timeout_ms: 5_000,
        rerank: RerankMode::Llm,
    };
    let pipeline = build_pipeline(&settings, embedder()).unwrap();
    assert!(pipeline.has_rewriter());
    assert_eq!(pipeline.reranker_name(), "llm");

    let resp = pipeline
        .search(&state(), &SearchRequest::new("био").with_top_k(3, 2))
        .await
        .unwrap();
    assert_eq!(resp.rewritten_query.as_deref(), Some("БИО"));

    settings.llm.api_key = None;
    let offline = build_pipeline(&settings, embedder()).unwrap();
    assert!(!offline.has_rewriter());
    assert_eq!(offline.reranker_name(), "truncate");
}

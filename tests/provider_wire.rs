use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use taskcrew::core::llm::{
    ChatMessage, HttpProvider, ImageData, LlmProvider, ProviderConfig, ProviderError, ProviderKind,
};

fn config(kind: ProviderKind, endpoint: String) -> ProviderConfig {
    ProviderConfig {
        kind,
        api_key: "test-key".to_string(),
        model: String::new(),
        endpoint,
    }
}

fn png() -> ImageData {
    ImageData {
        base64: "iVBORw0KGgo=".to_string(),
        media_type: "image/png".to_string(),
    }
}

#[tokio::test]
async fn minimax_speaks_anthropic_messages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/anthropic/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(body_partial_json(json!({
            "model": "MiniMax-M2.5",
            "messages": [{ "role": "user", "content": "hi" }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [
                { "type": "thinking", "thinking": "..." },
                { "type": "text", "text": "hello there" }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = HttpProvider::new();
    let cfg = config(
        ProviderKind::Minimax,
        format!("{}/anthropic/v1/messages", server.uri()),
    );
    let output = provider.chat(&[ChatMessage::user("hi")], &cfg).await.unwrap();
    assert_eq!(output.content, "hello there");
}

#[tokio::test]
async fn deepseek_posts_to_chat_completions_and_keeps_reasoning() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer test-key"))
        .and(body_partial_json(json!({ "model": "deepseek-chat", "max_tokens": 8192 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "42",
                    "reasoning_content": "thought about it"
                }
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = HttpProvider::new();
    let cfg = config(ProviderKind::Deepseek, format!("{}/", server.uri()));
    let output = provider
        .chat(&[ChatMessage::user("answer?")], &cfg)
        .await
        .unwrap();
    assert_eq!(output.content, "42");
    assert_eq!(output.reasoning.as_deref(), Some("thought about it"));
}

#[tokio::test]
async fn ollama_sends_images_beside_the_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({
            "model": "gemma3:4b",
            "stream": false,
            "messages": [{ "role": "user", "content": "what is this?", "images": ["iVBORw0KGgo="] }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": { "role": "assistant", "content": "a tiny png" },
            "done": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = HttpProvider::new();
    let mut cfg = config(ProviderKind::Ollama, server.uri());
    cfg.api_key.clear();
    let messages = [ChatMessage::user("what is this?").with_images(vec![png()])];
    let output = provider.chat(&messages, &cfg).await.unwrap();
    assert_eq!(output.content, "a tiny png");
}

#[tokio::test]
async fn http_failure_keeps_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("image input not supported"))
        .mount(&server)
        .await;

    let provider = HttpProvider::new();
    let cfg = config(ProviderKind::Deepseek, server.uri());
    let err = provider
        .chat(&[ChatMessage::user("look").with_images(vec![png()])], &cfg)
        .await
        .unwrap_err();
    match err {
        ProviderError::Http { status, body, .. } => {
            assert_eq!(status, 400);
            assert_eq!(body, "image input not supported");
        }
        other => panic!("expected an HTTP error, got {other}"),
    }
}

#[tokio::test]
async fn unreadable_body_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .mount(&server)
        .await;

    let provider = HttpProvider::new();
    let cfg = config(ProviderKind::Ollama, server.uri());
    let err = provider.chat(&[ChatMessage::user("hi")], &cfg).await.unwrap_err();
    assert!(matches!(err, ProviderError::Decode { .. }));
}

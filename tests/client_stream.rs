//! Streaming-client scenarios against a scripted HTTP fixture:
//! fragment assembly, engine counters, and the single reduced-shape
//! retry under memory pressure.

mod support;

use std::time::Duration;

use medir::client::{GenerateOptions, OllamaClient};
use medir::MedirError;
use support::{generate_stream_body, spawn_http, tags_body, Reply};

fn options() -> GenerateOptions {
    GenerateOptions {
        num_ctx: 4096,
        temperature: 0.7,
        top_p: 0.9,
        seed: 1234,
        max_tokens: 512,
    }
}

fn client(base_url: &str) -> OllamaClient {
    OllamaClient::with_timeout(base_url, Duration::from_secs(5)).unwrap()
}

#[test]
fn stream_assembles_fragments_and_counters() {
    let fixture = spawn_http(vec![Reply::ok(generate_stream_body(
        &["牛顿第一定律", "：惯性定律。"],
        100,
        2_000_000_000,
    ))]);
    let client = client(&fixture.base_url);

    let result = client
        .generate_stream("llama3.2:3b", "请解释牛顿第一定律。", &options(), "0s", None)
        .unwrap();

    assert_eq!(result.text, "牛顿第一定律：惯性定律。");
    assert!(result.latency_s > 0.0);
    assert!(result.first_token_s.is_some());
    assert!(result.first_token_s.unwrap() <= result.latency_s);
    assert_eq!(result.metrics.eval_count, Some(100));
    assert_eq!(result.metrics.tokens_per_second(), Some(50.0));
    assert_eq!(result.context, Some(vec![11, 22, 33]));
    assert!(!result.retried);

    let requests = fixture.finish();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/api/generate");
    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body["model"], "llama3.2:3b");
    assert_eq!(body["stream"], true);
    assert_eq!(body["options"]["num_predict"], 512);
    assert_eq!(body["keep_alive"], "0s");
}

#[test]
fn server_error_triggers_single_halved_retry() {
    let fixture = spawn_http(vec![
        Reply::error(500, r#"{"error":"CUDA out of memory"}"#),
        Reply::ok(generate_stream_body(&["ok"], 10, 1_000_000_000)),
    ]);
    let client = client(&fixture.base_url);

    let result = client
        .generate_with_retry("llama3.2:3b", "prompt", &options(), "0s")
        .unwrap();
    assert!(result.retried);
    assert_eq!(result.text, "ok");

    let requests = fixture.finish();
    assert_eq!(requests.len(), 2);
    let first: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    let second: serde_json::Value = serde_json::from_str(&requests[1].body).unwrap();
    assert_eq!(first["options"]["num_ctx"], 4096);
    assert_eq!(first["options"]["num_predict"], 512);
    assert_eq!(second["options"]["num_ctx"], 2048);
    assert_eq!(second["options"]["num_predict"], 256);
}

#[test]
fn retry_respects_shape_floors() {
    let fixture = spawn_http(vec![
        Reply::error(500, "out of memory"),
        Reply::ok(generate_stream_body(&["ok"], 5, 1_000_000_000)),
    ]);
    let client = client(&fixture.base_url);
    let small = GenerateOptions {
        num_ctx: 700,
        max_tokens: 80,
        ..options()
    };

    client
        .generate_with_retry("llama3.2:3b", "prompt", &small, "0s")
        .unwrap();

    let requests = fixture.finish();
    let second: serde_json::Value = serde_json::from_str(&requests[1].body).unwrap();
    assert_eq!(second["options"]["num_ctx"], 512);
    assert_eq!(second["options"]["num_predict"], 64);
}

#[test]
fn non_memory_error_propagates_without_retry() {
    let fixture = spawn_http(vec![Reply::error(404, "no such model")]);
    let client = client(&fixture.base_url);

    let err = client
        .generate_with_retry("missing:1b", "prompt", &options(), "0s")
        .unwrap_err();
    assert!(matches!(err, MedirError::Connection(_)));

    let requests = fixture.finish();
    assert_eq!(requests.len(), 1);
}

#[test]
fn truncated_stream_is_a_generation_error() {
    // Frames but no terminal done frame.
    let fixture = spawn_http(vec![Reply::ok(
        "{\"response\":\"partial\",\"done\":false}\n".to_string(),
    )]);
    let client = client(&fixture.base_url);

    let err = client
        .generate_stream("llama3.2:3b", "prompt", &options(), "0s", None)
        .unwrap_err();
    assert!(matches!(err, MedirError::Generation(_)));
    fixture.finish();
}

#[test]
fn error_frame_inside_stream_surfaces() {
    let fixture = spawn_http(vec![Reply::ok(
        "{\"error\":\"model failed to load\"}\n".to_string(),
    )]);
    let client = client(&fixture.base_url);

    let err = client
        .generate_stream("llama3.2:3b", "prompt", &options(), "0s", None)
        .unwrap_err();
    match err {
        MedirError::Generation(message) => assert!(message.contains("failed to load")),
        other => panic!("unexpected error: {other}"),
    }
    fixture.finish();
}

#[test]
fn installed_models_parses_tag_details() {
    let fixture = spawn_http(vec![Reply::ok(tags_body("llama3.2:3b"))]);
    let client = client(&fixture.base_url);

    let models = client.installed_models().unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].name, "llama3.2:3b");
    assert_eq!(models[0].parameter_size.as_deref(), Some("3.2B"));
    assert_eq!(models[0].quantization_level.as_deref(), Some("Q4_K_M"));

    let requests = fixture.finish();
    assert_eq!(requests[0].path, "/api/tags");
}

#[test]
fn context_tokens_are_forwarded() {
    let fixture = spawn_http(vec![Reply::ok(generate_stream_body(&["again"], 5, 1_000_000_000))]);
    let client = client(&fixture.base_url);

    client
        .generate_stream("llama3.2:3b", "continue", &options(), "5m", Some(&[7, 8, 9]))
        .unwrap();

    let requests = fixture.finish();
    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body["context"], serde_json::json!([7, 8, 9]));
}

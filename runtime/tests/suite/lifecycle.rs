//! Load, init and destroy transitions

use corehost_runtime::{CoreRuntime, Lifecycle, LoadError};
use corehost_types::{PerformError, PerformRequest, UnexpectedKind};
use serde_json::json;

use crate::common::{Harness, echo_core, request};

fn lifecycle_error(err: &PerformError) -> bool {
    matches!(err, PerformError::Unexpected(inner) if inner.kind == UnexpectedKind::Lifecycle)
}

#[tokio::test]
async fn perform_before_load_is_a_lifecycle_error() {
    let harness = Harness::new();
    let runtime = CoreRuntime::new(harness.services(), harness.config.clone());
    assert_eq!(runtime.lifecycle().await, Lifecycle::Unloaded);

    let err = runtime.perform(request(json!({}))).await.unwrap_err();
    assert!(lifecycle_error(&err));
    assert!(!err.requires_reload());

    let err = runtime.init().await.unwrap_err();
    assert!(lifecycle_error(&err));
}

#[tokio::test]
async fn invalid_module_fails_to_compile() {
    let harness = Harness::new();
    let runtime = CoreRuntime::new(harness.services(), harness.config.clone());
    let err = runtime.load_core(b"\0asm\x01\0\0\0garbage").await.unwrap_err();
    assert!(matches!(err, LoadError::Compile(_)));
    assert_eq!(runtime.lifecycle().await, Lifecycle::Unloaded);
}

#[tokio::test]
async fn load_from_filesystem() {
    let harness = Harness::new();
    harness.fs.insert("cores/echo.wat", echo_core());
    let runtime = CoreRuntime::new(harness.services(), harness.config.clone());

    let err = runtime.load_core_from("cores/missing.wasm").await.unwrap_err();
    assert!(matches!(err, LoadError::NotFound(ref path) if path == "cores/missing.wasm"));

    runtime.load_core_from("cores/echo.wat").await.unwrap();
    assert_eq!(runtime.lifecycle().await, Lifecycle::Compiled);
    runtime.init().await.unwrap();
    assert_eq!(runtime.lifecycle().await, Lifecycle::Ready);

    let result = runtime.perform(request(json!({"q": "rust"}))).await.unwrap();
    assert_eq!(result["map_input"], json!({"q": "rust"}));
}

#[tokio::test]
async fn init_is_idempotent_and_reload_is_refused_while_ready() {
    let harness = Harness::new();
    let runtime = harness.ready(&echo_core()).await;

    runtime.init().await.unwrap();
    assert_eq!(runtime.lifecycle().await, Lifecycle::Ready);

    let err = runtime.load_core(echo_core().as_bytes()).await.unwrap_err();
    assert!(matches!(err, LoadError::AlreadyInitialized));
}

#[tokio::test]
async fn destroy_is_final() {
    let harness = Harness::new();
    let runtime = harness.ready(&echo_core()).await;

    runtime.destroy().await.unwrap();
    assert_eq!(runtime.lifecycle().await, Lifecycle::TornDown);
    runtime.destroy().await.unwrap();

    let err = runtime.perform(request(json!({}))).await.unwrap_err();
    let PerformError::Unexpected(inner) = err else {
        panic!("expected a lifecycle error");
    };
    assert_eq!(inner.kind, UnexpectedKind::Lifecycle);
    assert!(inner.message.contains("destroyed"));

    let err = runtime.load_core(echo_core().as_bytes()).await.unwrap_err();
    assert!(matches!(err, LoadError::Destroyed));
    assert!(lifecycle_error(&runtime.init().await.unwrap_err()));
}

#[tokio::test]
async fn blank_request_fields_fail_validation() {
    let harness = Harness::new();
    let runtime = harness.ready(&echo_core()).await;

    let blank = PerformRequest::new("https://profiles.example.com/search", "", "map", "Search");
    let err = runtime.perform(blank).await.unwrap_err();
    let PerformError::Validation(inner) = err else {
        panic!("expected a validation error");
    };
    assert_eq!(inner.code, "PerformRequestValidationError");
    assert!(inner.message.contains("provider_url"));

    // The core is untouched and keeps serving.
    assert_eq!(runtime.lifecycle().await, Lifecycle::Ready);
    runtime.perform(request(json!(1))).await.unwrap();
}

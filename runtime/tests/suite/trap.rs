//! Recovery after the core traps or breaks the suspension protocol

use corehost_runtime::Lifecycle;
use corehost_types::{PerformError, UnexpectedKind};
use serde_json::json;

use crate::common::{
    CoreBuilder, DUMP_EVENTS, Harness, METRIC_EVENT, OUT_BUFFER, RecordingPersistence, echo_core,
    echo_core_trapping_in, request, sending_core,
};

fn unexpected_kind(err: &PerformError) -> Option<&UnexpectedKind> {
    match err {
        PerformError::Unexpected(inner) => Some(&inner.kind),
        _ => None,
    }
}

#[tokio::test]
async fn trap_discards_the_instance_and_salvages_its_events() {
    let harness = Harness::new();
    let runtime = harness.ready(&echo_core()).await;
    runtime.perform(request(json!("fine"))).await.unwrap();
    assert_eq!(harness.timers.armed().len(), 1);

    let err = runtime.perform(request(json!("boom!"))).await.unwrap_err();
    assert_eq!(unexpected_kind(&err), Some(&UnexpectedKind::Trap));
    assert!(err.requires_reload());

    assert_eq!(harness.persistence.dumps(), vec![DUMP_EVENTS.map(String::from).to_vec()]);
    assert_eq!(harness.persistence.metrics(), vec![vec![METRIC_EVENT.to_string()]]);
    assert!(harness.timers.armed().is_empty());
    assert_eq!(harness.timers.cleared().len(), 1);
    assert_eq!(runtime.lifecycle().await, Lifecycle::Compiled);

    let err = runtime.perform(request(json!("again"))).await.unwrap_err();
    assert_eq!(unexpected_kind(&err), Some(&UnexpectedKind::Lifecycle));

    runtime.init().await.unwrap();
    let result = runtime.perform(request(json!("recovered"))).await.unwrap();
    assert_eq!(result["map_input"], "recovered");
}

#[tokio::test]
async fn persistence_failures_do_not_mask_the_trap() {
    let harness = Harness::with_persistence(RecordingPersistence::failing());
    let runtime = harness.ready(&echo_core()).await;

    let err = runtime.perform(request(json!("boom!"))).await.unwrap_err();
    assert_eq!(unexpected_kind(&err), Some(&UnexpectedKind::Trap));
    assert_eq!(harness.persistence.dumps().len(), 1);
    // Nothing was recorded before the trap.
    assert!(harness.persistence.metrics().is_empty());
}

#[tokio::test]
async fn host_call_during_unwind_is_a_bridge_violation() {
    let open = r#"{"kind":"file-open","path":"notes.txt","read":true}"#;
    let harness = Harness::new();
    harness.fs.insert("notes.txt", "hello");
    let runtime = harness.ready(&sending_core(&[open, open])).await;

    let err = runtime.perform(request(json!({}))).await.unwrap_err();
    assert_eq!(unexpected_kind(&err), Some(&UnexpectedKind::BridgeViolation));
    assert!(err.requires_reload());
    assert_eq!(runtime.lifecycle().await, Lifecycle::Compiled);

    // The broken instance still reported its arenas.
    assert_eq!(harness.persistence.dumps().len(), 1);
    assert_eq!(harness.persistence.metrics(), vec![vec![METRIC_EVENT.to_string()]]);
}

fn dumped() -> Vec<Vec<String>> {
    vec![DUMP_EVENTS.map(String::from).to_vec()]
}

#[tokio::test]
async fn trap_in_metrics_export_discards_the_instance() {
    let harness = Harness::new();
    let runtime = harness
        .ready(&echo_core_trapping_in(&["core_get_metrics"]))
        .await;
    runtime.perform(request(json!("fine"))).await.unwrap();

    harness.timers.fire_all().await;
    assert_eq!(runtime.lifecycle().await, Lifecycle::Compiled);
    assert_eq!(harness.persistence.dumps(), dumped());
    assert!(harness.persistence.metrics().is_empty());

    let err = runtime.perform(request(json!("again"))).await.unwrap_err();
    assert_eq!(unexpected_kind(&err), Some(&UnexpectedKind::Lifecycle));

    runtime.init().await.unwrap();
    let result = runtime.perform(request(json!("recovered"))).await.unwrap();
    assert_eq!(result["map_input"], "recovered");
}

#[tokio::test]
async fn trap_while_clearing_metrics_fails_destroy() {
    let harness = Harness::new();
    let runtime = harness
        .ready(&echo_core_trapping_in(&["core_clear_metrics"]))
        .await;
    runtime.perform(request(json!("fine"))).await.unwrap();

    let err = runtime.destroy().await.unwrap_err();
    assert_eq!(unexpected_kind(&err), Some(&UnexpectedKind::Trap));
    assert_eq!(runtime.lifecycle().await, Lifecycle::TornDown);
    assert_eq!(harness.persistence.dumps(), dumped());
    // The uncleared arena is forwarded once, by the salvage.
    assert_eq!(harness.persistence.metrics(), vec![vec![METRIC_EVENT.to_string()]]);
}

#[tokio::test]
async fn trap_in_teardown_is_reported_by_destroy() {
    let harness = Harness::new();
    let runtime = harness
        .ready(&echo_core_trapping_in(&["core_teardown"]))
        .await;
    runtime.perform(request(json!("fine"))).await.unwrap();

    let err = runtime.destroy().await.unwrap_err();
    assert_eq!(unexpected_kind(&err), Some(&UnexpectedKind::Trap));
    assert_eq!(runtime.lifecycle().await, Lifecycle::TornDown);
    assert_eq!(harness.persistence.metrics(), vec![vec![METRIC_EVENT.to_string()]]);
    assert_eq!(harness.persistence.dumps(), dumped());

    let err = runtime.perform(request(json!("late"))).await.unwrap_err();
    assert_eq!(unexpected_kind(&err), Some(&UnexpectedKind::Lifecycle));
}

/// Sends a request of `len` bytes starting at address 0 and reports the
/// reply as the result.
fn oversized_request_core(len: i32) -> String {
    CoreBuilder::new().build(&format!(
        r#"
  (func (export "core_perform")
    (local $len i32)
    (local.set $len (i32.wrap_i64 (call $exchange (i32.const 0) (i32.const {len}))))
    (drop (call $send_result (i32.const {OUT_BUFFER}) (local.get $len))))
"#
    ))
}

#[tokio::test]
async fn oversized_request_is_refused_without_a_trap() {
    let mut harness = Harness::new();
    harness.config.max_message_bytes = 512;

    // Past the end of memory, and a length that is negative as an i32.
    for len in [100_000, -1] {
        let runtime = harness.ready(&oversized_request_core(len)).await;
        let result = runtime.perform(request(json!({}))).await.unwrap();
        assert_eq!(result["kind"], "err");
        assert_eq!(result["error_code"], "MessageTooLarge");
        assert_eq!(runtime.lifecycle().await, Lifecycle::Ready);
    }
    assert!(harness.persistence.dumps().is_empty());
}

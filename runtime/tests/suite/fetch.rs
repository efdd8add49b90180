//! HTTP round trips that suspend the core

use serde_json::json;

use crate::common::{CoreBuilder, Harness, SCRATCH, request};

const BODY_ADDR: u32 = 12288;
const HEAD_PREFIX: &str = r#"{"kind":"http-call-head","handle":"#;
/// Error-tagged ENOTSUP in the wide encoding.
const ENOTSUP: u64 = 0x1_0000_005f;

/// Issues a GET, waits for the head, drains the body stream and reports the
/// body as the result. Handles are taken from the replies. Writing to the
/// read-only body stream must fail with ENOTSUP or the core traps.
fn fetch_core() -> String {
    let mut core = CoreBuilder::new();
    let (call, call_len) = core.message(
        r#"{"kind":"http-call","method":"GET","url":"https://api.example.com/items","headers":{"accept":["application/json"]}}"#,
    );
    let (head_prefix, head_prefix_len) = core.message(HEAD_PREFIX);
    let (handle_key, handle_key_len) = core.message(r#""handle":"#);
    let (stream_key, stream_key_len) = core.message(r#""body_stream":"#);
    let handle_at = SCRATCH as usize + head_prefix_len;
    core.build(&format!(
        r#"
  (global $body_len (mut i32) (i32.const 0))
  (global $head_len (mut i32) (i32.const 0))
  (global $stream (mut i32) (i32.const 0))

  (func (export "core_perform")
    (local $reply i32)
    (local $read i64)
    (local $write i64)
    (call $begin)
    (if (i32.eqz (global.get $step)) (then
      (global.set $body_len (i32.const 0))
      (local.set $reply (i32.wrap_i64 (call $exchange (i32.const {call}) (i32.const {call_len}))))
      (memory.copy (i32.const {SCRATCH}) (i32.const {head_prefix}) (i32.const {head_prefix_len}))
      (global.set $head_len
        (i32.add (i32.const {head_prefix_len})
          (call $write_number (i32.const {handle_at})
            (call $number_after (i32.const {handle_key}) (i32.const {handle_key_len}) (local.get $reply)))))
      (i32.store8 (i32.add (i32.const {SCRATCH}) (global.get $head_len)) (i32.const 125))
      (global.set $head_len (i32.add (global.get $head_len) (i32.const 1)))
      (global.set $step (i32.const 1))))
    (if (i32.eq (global.get $step) (i32.const 1)) (then
      (local.set $reply (i32.wrap_i64 (call $exchange (i32.const {SCRATCH}) (global.get $head_len))))
      (if (call $unwinding) (then return))
      (global.set $stream
        (call $number_after (i32.const {stream_key}) (i32.const {stream_key_len}) (local.get $reply)))
      (global.set $step (i32.const 2))))
    (if (i32.eq (global.get $step) (i32.const 2)) (then
      (block $eof
        (loop $more
          (local.set $read
            (call $stream_read (global.get $stream)
              (i32.add (i32.const {BODY_ADDR}) (global.get $body_len))
              (i32.const 1024)))
          (if (call $unwinding) (then return))
          (br_if $eof (i64.eqz (local.get $read)))
          (global.set $body_len (i32.add (global.get $body_len) (i32.wrap_i64 (local.get $read))))
          (br $more)))
      (global.set $step (i32.const 3))))
    (if (i32.eq (global.get $step) (i32.const 3)) (then
      (local.set $write (call $stream_write (global.get $stream) (i32.const {BODY_ADDR}) (i32.const 1)))
      (if (call $unwinding) (then return))
      (if (i64.ne (local.get $write) (i64.const {ENOTSUP})) (then unreachable))
      (global.set $step (i32.const 4))))
    (if (i32.eq (global.get $step) (i32.const 4)) (then
      (drop (call $stream_close (global.get $stream)))
      (if (call $unwinding) (then return))
      (global.set $step (i32.const 5))))
    (drop (call $send_result (i32.const {BODY_ADDR}) (global.get $body_len))))
"#
    ))
}

#[tokio::test]
async fn fetch_result_reaches_the_caller() {
    let harness = Harness::new();
    let runtime = harness.ready(&fetch_core()).await;

    let result = runtime.perform(request(json!({}))).await.unwrap();
    assert_eq!(result, json!({"items": [1, 2, 3]}));

    let requests = harness.network.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].url, "https://api.example.com/items");
    assert_eq!(requests[0].headers["accept"], vec!["application/json"]);

    // Head, one read per body chunk, the EOF read, the refused write and
    // the close.
    assert_eq!(runtime.suspensions().await, 6);
}

#[tokio::test]
async fn consecutive_performs_start_from_a_clean_core() {
    let harness = Harness::new();
    let runtime = harness.ready(&fetch_core()).await;

    for _ in 0..3 {
        let result = runtime.perform(request(json!({}))).await.unwrap();
        assert_eq!(result["items"], json!([1, 2, 3]));
    }
    assert_eq!(harness.network.requests().len(), 3);
}

#[tokio::test]
async fn concurrent_performs_are_serialized() {
    let harness = Harness::new();
    let runtime = harness.ready(&fetch_core()).await;

    let first = runtime.clone();
    let second = runtime.clone();
    let (a, b) = tokio::join!(
        first.perform(request(json!({"n": 1}))),
        second.perform(request(json!({"n": 2}))),
    );
    assert_eq!(a.unwrap()["items"], json!([1, 2, 3]));
    assert_eq!(b.unwrap()["items"], json!([1, 2, 3]));
    assert_eq!(runtime.suspensions().await, 12);
}

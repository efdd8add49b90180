//! Replies too large for the core's buffer are parked and retrieved later

use corehost_types::{AbiResult, Errno, PairEncoding};
use serde_json::json;

use crate::common::{CoreBuilder, Harness, PERFORM_INPUT, request};

const REPLY_ADDR: u32 = 12288;

/// Offers a 16 byte buffer for the perform input, then walks the retrieval
/// protocol: too small (ERANGE), big enough, and gone (EBADF). Pairs are
/// unpacked in `encoding`'s layout. Any deviation traps.
fn message_store_core(encoding: PairEncoding) -> String {
    let (low_mask, shift) = match encoding {
        PairEncoding::Wide => (0xFFFF_FFFF_u64, 32),
        PairEncoding::Safe => (0x7FFF_FFFF_u64, 31),
    };
    let erange = AbiResult::Err(Errno::Range).encode(encoding).unwrap();
    let ebadf = AbiResult::Err(Errno::BadF).encode(encoding).unwrap();
    let mut core = CoreBuilder::new();
    let (input, input_len) = core.message(PERFORM_INPUT);
    core.build(&format!(
        r#"
  (func (export "core_perform")
    (local $pair i64)
    (local $size i32)
    (local $handle i32)
    (local.set $pair
      (call $message_exchange (i32.const {input}) (i32.const {input_len}) (i32.const {REPLY_ADDR}) (i32.const 16)))
    (local.set $size (i32.wrap_i64 (i64.and (local.get $pair) (i64.const {low_mask}))))
    (local.set $handle (i32.wrap_i64 (i64.shr_u (local.get $pair) (i64.const {shift}))))
    (if (i32.eqz (local.get $handle)) (then unreachable))
    (if (i32.le_u (local.get $size) (i32.const 16)) (then unreachable))
    (if (i64.ne
          (call $message_exchange_retrieve (local.get $handle) (i32.const {REPLY_ADDR}) (i32.const 8))
          (i64.const {erange}))
      (then unreachable))
    (if (i64.ne
          (call $message_exchange_retrieve (local.get $handle) (i32.const {REPLY_ADDR}) (i32.const 4096))
          (i64.extend_i32_u (local.get $size)))
      (then unreachable))
    (if (i64.ne
          (call $message_exchange_retrieve (local.get $handle) (i32.const {REPLY_ADDR}) (i32.const 4096))
          (i64.const {ebadf}))
      (then unreachable))
    (drop (call $send_result (i32.const {REPLY_ADDR}) (local.get $size))))
"#
    ))
}

#[tokio::test]
async fn oversized_reply_is_retrieved_once() {
    let harness = Harness::new();
    let runtime = harness.ready(&message_store_core(PairEncoding::Wide)).await;

    let input = json!({"query": "a long enough input to overflow sixteen bytes"});
    let result = runtime.perform(request(input.clone())).await.unwrap();
    assert_eq!(result["kind"], "ok");
    assert_eq!(result["map_input"], input);
    assert_eq!(runtime.suspensions().await, 0);
}

#[tokio::test]
async fn parked_replies_do_not_leak_between_performs() {
    let harness = Harness::new();
    let runtime = harness.ready(&message_store_core(PairEncoding::Wide)).await;

    for n in 0..3 {
        let result = runtime.perform(request(json!({"n": n}))).await.unwrap();
        assert_eq!(result["map_input"]["n"], n);
    }
}

#[tokio::test]
async fn safe_encoding_is_used_for_every_import() {
    let mut harness = Harness::new();
    harness.config.pair_encoding = PairEncoding::Safe;
    let runtime = harness.ready(&message_store_core(PairEncoding::Safe)).await;

    let input = json!({"query": "packed below two to the fifty-third"});
    for _ in 0..2 {
        let result = runtime.perform(request(input.clone())).await.unwrap();
        assert_eq!(result["map_input"], input);
    }
}

#[tokio::test]
async fn wide_core_cannot_read_safe_pairs() {
    let mut harness = Harness::new();
    harness.config.pair_encoding = PairEncoding::Safe;
    let runtime = harness.ready(&message_store_core(PairEncoding::Wide)).await;

    let input = json!({"query": "a long enough input to overflow sixteen bytes"});
    runtime.perform(request(input)).await.unwrap_err();
}

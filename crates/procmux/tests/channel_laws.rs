//! Channel-algebra laws: registry lifecycle, non-blocking receive, name
//! bounds, and per-channel FIFO matching order.

use std::time::{Duration, Instant};

use procmux::{Chunk, OpEngineFactory, Runtime, RuntimeError, RuntimeSettings, Value};

fn runtime(workers: usize) -> Runtime {
    let _ = env_logger::builder().is_test(true).try_init();
    let settings = RuntimeSettings { workers, ..RuntimeSettings::default() };
    Runtime::new(settings, Box::new(OpEngineFactory::new())).expect("runtime")
}

fn wait_until(what: &str, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_create_destroy_then_send_is_not_found() {
    let rt = runtime(1);
    rt.new_channel("n").expect("create");
    rt.del_channel("n").expect("destroy");
    assert_eq!(
        rt.send("n", vec![Value::Nil]),
        Err(RuntimeError::ChannelNotFound { name: "n".into() })
    );
    // The name is free again.
    rt.new_channel("n").expect("recreate");
    rt.wait();
}

#[test]
fn test_double_create_is_exists() {
    let rt = runtime(1);
    rt.new_channel("n").expect("first create");
    assert_eq!(
        rt.new_channel("n"),
        Err(RuntimeError::ChannelExists { name: "n".into() })
    );
    rt.wait();
}

#[test]
fn test_destroy_missing_is_not_found() {
    let rt = runtime(1);
    assert_eq!(
        rt.del_channel("ghost"),
        Err(RuntimeError::ChannelNotFound { name: "ghost".into() })
    );
    rt.wait();
}

#[test]
fn test_async_receive_empty_does_not_block() {
    let rt = runtime(1);
    rt.new_channel("quiet").expect("create");
    let started = Instant::now();
    assert_eq!(
        rt.try_receive("quiet"),
        Err(RuntimeError::NoSenders { name: "quiet".into() })
    );
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "a non-blocking receive must return immediately"
    );
    rt.wait();
}

#[test]
fn test_channel_name_cap() {
    let rt = runtime(1);
    rt.new_channel(&"a".repeat(255)).expect("255-byte name");
    assert!(matches!(
        rt.new_channel(&"b".repeat(256)),
        Err(RuntimeError::InvalidArgument { .. })
    ));
    rt.wait();
}

#[test]
fn test_parked_senders_match_in_fifo_order() {
    let rt = runtime(2);
    rt.new_channel("c").expect("create");

    rt.new_process(Chunk::source("send c \"first\"")).expect("spawn");
    wait_until("first sender to park", || rt.channel_depths("c") == Some((1, 0)));
    rt.new_process(Chunk::source("send c \"second\"")).expect("spawn");
    wait_until("second sender to park", || rt.channel_depths("c") == Some((2, 0)));

    assert_eq!(rt.receive("c").expect("first"), vec![Value::str("first")]);
    assert_eq!(rt.receive("c").expect("second"), vec![Value::str("second")]);
    rt.wait();
}

#[test]
fn test_parked_receivers_match_in_fifo_order() {
    let rt = runtime(2);
    for name in ["c", "out1", "out2"] {
        rt.new_channel(name).expect("create");
    }

    rt.new_process(Chunk::source("recv c\nsendlast out1")).expect("spawn");
    wait_until("first receiver to park", || rt.channel_depths("c") == Some((0, 1)));
    rt.new_process(Chunk::source("recv c\nsendlast out2")).expect("spawn");
    wait_until("second receiver to park", || rt.channel_depths("c") == Some((0, 2)));

    rt.send("c", vec![Value::str("one")]).expect("send one");
    rt.send("c", vec![Value::str("two")]).expect("send two");

    assert_eq!(rt.receive("out1").expect("out1"), vec![Value::str("one")]);
    assert_eq!(rt.receive("out2").expect("out2"), vec![Value::str("two")]);
    rt.wait();
}

#[test]
fn test_wait_queues_never_hold_both_sides() {
    let rt = runtime(2);
    rt.new_channel("c").expect("create");

    rt.new_process(Chunk::source("send c 1")).expect("spawn sender");
    wait_until("sender to park", || rt.channel_depths("c") == Some((1, 0)));

    // A receiver arriving now must match, not park alongside.
    assert_eq!(rt.receive("c").expect("receive"), vec![Value::Number(1.0)]);
    let (senders, receivers) = rt.channel_depths("c").expect("channel");
    assert!(
        senders == 0 || receivers == 0,
        "at most one wait queue may be non-empty (got {senders}/{receivers})"
    );
    rt.wait();
}

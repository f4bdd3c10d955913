//! End-to-end driver scenarios: sources through sinks under the real
//! scheduler, hot-swap, link emulation, exit handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use weft::driver::{self, ConfigSource, DriverOptions};
use weft::elements::default_registry;
use weft::lang::parse_string;
use weft::router::Router;
use weft::schedule::Master;

fn build(master: &Arc<Master>, text: &str) -> Arc<Router> {
    let registry = default_registry();
    let parsed = parse_string(text, "test", &registry.class_names(), &HashMap::new())
        .unwrap_or_else(|e| panic!("parse failed: {:?}", e));
    Router::from_config(&parsed, text, &registry, master)
        .unwrap_or_else(|e| panic!("load failed: {:?}", e))
}

fn read_u64(router: &Router, spec: &str) -> u64 {
    router
        .call_read(spec)
        .unwrap_or_else(|e| panic!("read {}: {}", spec, e))
        .trim()
        .parse()
        .expect("numeric handler value")
}

fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_source_counter_sink() {
    let master = Master::new(1);
    let router = build(
        &master,
        "src :: InfiniteSource(LENGTH 100, LIMIT 500, STOP true);\n\
         src -> cnt :: Counter -> Discard;",
    );
    master.install(Arc::clone(&router));
    router.activate();
    master.run();

    assert_eq!(read_u64(&router, "src.count"), 500);
    assert_eq!(read_u64(&router, "cnt.count"), 500);
    assert_eq!(read_u64(&router, "cnt.byte_count"), 500 * 100);
    // thread statistics saw the task run
    let stats = router.call_read("threads").unwrap();
    assert!(stats.contains("tasks_run"));
}

#[test]
fn test_queue_boundary_delivers_everything() {
    let master = Master::new(1);
    let router = build(
        &master,
        "src :: InfiniteSource(LIMIT 400);\n\
         src -> q :: Queue(64) -> Unqueue -> cnt :: Counter -> Discard;",
    );
    master.install(Arc::clone(&router));
    router.activate();

    let runner = {
        let master = Arc::clone(&master);
        thread::spawn(move || master.run())
    };
    wait_until(
        || read_u64(&router, "cnt.count") + read_u64(&router, "q.drops") >= 400,
        "queue to drain",
    );
    master.please_stop_current();
    runner.join().unwrap();

    // every packet either arrived or was counted as an overflow drop
    let arrived = read_u64(&router, "cnt.count");
    let dropped = read_u64(&router, "q.drops");
    assert_eq!(arrived + dropped, 400);
    assert_eq!(read_u64(&router, "q.length"), 0);
}

#[test]
fn test_competing_sources_share_the_thread() {
    let master = Master::new(1);
    let router = build(
        &master,
        "s1 :: InfiniteSource(LIMIT 1000); s2 :: InfiniteSource(LIMIT 1000);\n\
         s1 -> c1 :: Counter -> Discard;\n\
         s2 -> c2 :: Counter -> Discard;",
    );
    master.install(Arc::clone(&router));
    router.activate();

    let runner = {
        let master = Arc::clone(&master);
        thread::spawn(move || master.run())
    };
    wait_until(
        || read_u64(&router, "c1.count") == 1000 && read_u64(&router, "c2.count") == 1000,
        "both sources to finish",
    );
    master.please_stop_current();
    runner.join().unwrap();
}

#[test]
fn test_hotswap_conserves_packets() {
    let master = Master::new(1);
    let old = build(
        &master,
        "src :: InfiniteSource(BURST 4);\n\
         src -> cnt :: Counter -> Discard;",
    );
    master.install(Arc::clone(&old));
    old.activate();

    let runner = {
        let master = Arc::clone(&master);
        thread::spawn(move || master.run())
    };
    wait_until(|| read_u64(&old, "cnt.count") > 500, "traffic before swap");

    let new = build(
        &master,
        "src2 :: InfiniteSource(BURST 4);\n\
         src2 -> cnt2 :: Counter -> Discard;",
    );
    new.set_hotswap_predecessor(master.current_router().unwrap());
    master.request_hotswap(Arc::clone(&new)).unwrap();

    wait_until(|| read_u64(&new, "cnt2.count") > 500, "traffic after swap");
    master.please_stop_current();
    runner.join().unwrap();

    // the outgoing router stopped at the swap and never ran again
    assert!(old.runcount() <= 0);
    let old_src = read_u64(&old, "src.count");
    let old_cnt = read_u64(&old, "cnt.count");
    thread::sleep(Duration::from_millis(50));
    assert_eq!(read_u64(&old, "src.count"), old_src);

    // every emitted packet was counted by exactly one router
    assert_eq!(old_cnt, old_src);
    assert_eq!(read_u64(&new, "cnt2.count"), read_u64(&new, "src2.count"));
}

#[test]
fn test_hotswap_requests_serialize() {
    let master = Master::new(1);
    let a = build(&master, "Idle;");
    let b = build(&master, "Idle;");
    // nothing drains the pending slot (no driver is running), so the
    // second request must be refused rather than silently dropping
    // the first candidate
    master.request_hotswap(a).unwrap();
    assert!(master.request_hotswap(b).is_err());
}

#[test]
fn test_queue_contents_survive_hotswap() {
    let master = Master::new(1);
    // the pump is inactive, so 100 packets pile up in the queue
    let old = build(
        &master,
        "src :: InfiniteSource(LIMIT 100);\n\
         src -> q :: Queue(200);\n\
         q -> Unqueue(ACTIVE false) -> Discard;",
    );
    master.install(Arc::clone(&old));
    old.activate();

    let runner = {
        let master = Arc::clone(&master);
        thread::spawn(move || master.run())
    };
    wait_until(|| read_u64(&old, "q.length") == 100, "queue to fill");

    // same-named queue in the replacement adopts the backlog
    let new = build(
        &master,
        "Idle -> q :: Queue(200);\n\
         q -> Unqueue -> cnt :: Counter -> Discard;",
    );
    new.set_hotswap_predecessor(master.current_router().unwrap());
    master.request_hotswap(Arc::clone(&new)).unwrap();

    wait_until(|| read_u64(&new, "cnt.count") == 100, "backlog to drain");
    master.please_stop_current();
    runner.join().unwrap();

    assert_eq!(read_u64(&old, "q.length"), 0);
}

#[test]
fn test_link_unqueue_paces_delivery() {
    let master = Master::new(1);
    // 1000-byte packets over 8 Mbit/s serialize at 1 ms each; the
    // source floods the queue immediately, so anything the counter
    // misses is still in the emulated link
    let router = build(
        &master,
        "src :: InfiniteSource(LENGTH 1000, LIMIT 1000);\n\
         src -> q :: Queue(2000);\n\
         q -> link :: LinkUnqueue(LATENCY 10ms, BANDWIDTH 8Mbps) -> cnt :: Counter -> Discard;",
    );
    master.install(Arc::clone(&router));
    router.activate();

    let runner = {
        let master = Arc::clone(&master);
        thread::spawn(move || master.run())
    };
    wait_until(|| read_u64(&router, "cnt.count") > 20, "link to deliver");
    thread::sleep(Duration::from_millis(100));
    let delivered = read_u64(&router, "cnt.count");
    master.please_stop_current();
    runner.join().unwrap();

    // pacing: the wire cannot have moved all 1000 packets yet
    assert!(delivered < 1000, "delivered {} without shaping", delivered);
    assert!(delivered > 20);
}

#[test]
fn test_exit_handler_maps_booleans_and_integers() {
    // "true" exits 0
    let mut opts = DriverOptions::new(ConfigSource::Expr(
        "src :: InfiniteSource(LIMIT 5, STOP true); src -> Discard;".to_string(),
    ));
    opts.exit_handler = Some("src.active".to_string());
    assert_eq!(driver::run(opts).unwrap(), 0);

    // "false" exits 1; -q skips the driver loop entirely
    let mut opts = DriverOptions::new(ConfigSource::Expr(
        "src :: InfiniteSource(ACTIVE false); src -> Discard;".to_string(),
    ));
    opts.exit_handler = Some("src.active".to_string());
    opts.quit = true;
    assert_eq!(driver::run(opts).unwrap(), 1);

    // integers pass through
    let mut opts = DriverOptions::new(ConfigSource::Expr(
        "src :: InfiniteSource; src -> cnt :: Counter -> Discard;".to_string(),
    ));
    opts.exit_handler = Some("cnt.count".to_string());
    opts.quit = true;
    assert_eq!(driver::run(opts).unwrap(), 0);
}

#[test]
fn test_driver_rejects_broken_configuration() {
    let opts = DriverOptions::new(ConfigSource::Expr(
        "src :: NoSuchElement; src -> Discard;".to_string(),
    ));
    assert!(driver::run(opts).is_err());
}

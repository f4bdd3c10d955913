//! Control-socket protocol over a real TCP connection.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

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

fn connect(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return stream,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
            Err(e) => panic!("cannot connect to control socket: {}", e),
        }
    }
}

fn request(reader: &mut BufReader<TcpStream>, line: &str) -> Vec<String> {
    reader
        .get_mut()
        .write_all(line.as_bytes())
        .expect("send request");
    let mut status = String::new();
    reader.read_line(&mut status).expect("read status");
    let mut lines = vec![status.trim_end().to_string()];
    if lines[0].starts_with("200") && line.trim_start().to_uppercase().starts_with("READ") {
        let mut payload = String::new();
        reader.read_line(&mut payload).expect("read payload");
        lines.push(payload.trim_end().to_string());
    }
    lines
}

#[test]
fn test_read_write_over_tcp() {
    let master = Master::new(1);
    let router = build(
        &master,
        "src :: InfiniteSource(LIMIT 100);\n\
         src -> cnt :: Counter -> Discard;\n\
         cs :: ControlSocket(tcp, 39700+);",
    );
    master.install(Arc::clone(&router));
    router.activate();

    let runner = {
        let master = Arc::clone(&master);
        thread::spawn(move || master.run())
    };

    // wait for the source to finish so the count is deterministic
    let deadline = Instant::now() + Duration::from_secs(5);
    while router.call_read("cnt.count").unwrap() != "100" {
        assert!(Instant::now() < deadline, "source never finished");
        thread::sleep(Duration::from_millis(5));
    }

    let port: u16 = router.call_read("cs.port").unwrap().parse().unwrap();
    let mut reader = BufReader::new(connect(port));

    // S5: a read returns 200 OK and the value
    assert_eq!(
        request(&mut reader, "READ cnt.count\n"),
        vec!["200 OK", "100"]
    );

    // unknown handlers are 5xx, not dropped connections
    let lines = request(&mut reader, "READ cnt.missing\n");
    assert!(lines[0].starts_with("511"), "got {:?}", lines);
    let lines = request(&mut reader, "BOGUS\n");
    assert!(lines[0].starts_with("501"), "got {:?}", lines);

    // writes work; stopping the router ends the driver loop
    assert_eq!(
        request(&mut reader, "WRITE cnt.reset_counts\n"),
        vec!["200 OK"]
    );
    assert_eq!(
        request(&mut reader, "READ cnt.count\n"),
        vec!["200 OK", "0"]
    );
    assert_eq!(request(&mut reader, "WRITE stop\n"), vec!["200 OK"]);
    runner.join().unwrap();
}

#[test]
fn test_hotconfig_write_swaps_the_running_router() {
    use weft::driver::{self, ConfigSource, DriverOptions};

    let mut opts = DriverOptions::new(ConfigSource::Expr(
        "src :: InfiniteSource(BURST 2); src -> cnt :: Counter -> Discard;".to_string(),
    ));
    opts.tcp_ports = vec!["47113".to_string()];
    opts.allow_reconfigure = true;
    opts.exit_handler = Some("cnt2.count".to_string());
    let driver_thread = thread::spawn(move || driver::run(opts));

    let mut reader = BufReader::new(connect(47113));

    // a broken replacement is refused and the old router keeps running
    let lines = request(&mut reader, "WRITE hotconfig src2 :: NoSuchClass;\n");
    assert!(lines[0].starts_with("5"), "got {:?}", lines);
    let lines = request(&mut reader, "READ cnt.count\n");
    assert_eq!(lines[0], "200 OK");

    // a good one swaps in; the write is acknowledged on this
    // connection, which still belongs to the outgoing router
    let lines = request(
        &mut reader,
        "WRITE hotconfig src2 :: InfiniteSource(BURST 2); src2 -> cnt2 :: Counter -> Discard;\n",
    );
    assert_eq!(lines[0], "200 OK");
    thread::sleep(Duration::from_millis(100));

    // the replacement's control socket adopted the listener: a fresh
    // connection reaches the new namespace
    let mut fresh = BufReader::new(connect(47113));
    let lines = request(&mut fresh, "READ cnt2.count\n");
    assert_eq!(lines[0], "200 OK");
    let lines = request(&mut fresh, "WRITE stop\n");
    assert_eq!(lines[0], "200 OK");

    // the exit handler reads the post-swap counter
    let code = driver_thread.join().unwrap().unwrap();
    assert!(code > 0, "replacement router never moved a packet");
}

#[test]
fn test_concurrent_clients() {
    let master = Master::new(1);
    let router = build(
        &master,
        "src :: InfiniteSource(LIMIT 10, STOP false);\n\
         src -> cnt :: Counter -> Discard;\n\
         cs :: ControlSocket(tcp, 39800+);",
    );
    master.install(Arc::clone(&router));
    router.activate();

    let runner = {
        let master = Arc::clone(&master);
        thread::spawn(move || master.run())
    };

    let port: u16 = router.call_read("cs.port").unwrap().parse().unwrap();
    let workers: Vec<_> = (0..4)
        .map(|_| {
            thread::spawn(move || {
                let mut reader = BufReader::new(connect(port));
                for _ in 0..20 {
                    let lines = request(&mut reader, "READ cnt.count\n");
                    assert_eq!(lines[0], "200 OK");
                    let _: u64 = lines[1].parse().expect("count is numeric");
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    master.please_stop_current();
    runner.join().unwrap();
}

mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use tcpros::{
    config::DEFAULT_HOST,
    core::{Node, RpcValue},
    slave::REMOTE_SHUTDOWN,
    NodeError,
};

use common::FakeMaster;

#[test]
fn test_slave_api_reports_topics() {
    let master = FakeMaster::new();
    let node = master.node("introspected");
    let _publisher = node.advertise::<String>("out", false).unwrap();
    let _subscriber = node.subscribe("in", |_: u32| {}).unwrap();
    let uri = node.get_node_uri().to_string();

    let response = master.call_node(&uri, "getPublications", vec!["/test".into()]);
    assert_eq!(response.code, 1);
    assert_eq!(
        response.value,
        RpcValue::from(vec![vec!["/out".to_string(), "std_msgs/String".to_string()]])
    );

    let response = master.call_node(&uri, "getSubscriptions", vec!["/test".into()]);
    assert_eq!(
        response.value,
        RpcValue::from(vec![vec!["/in".to_string(), "std_msgs/UInt32".to_string()]])
    );

    let response = master.call_node(&uri, "getMasterUri", vec!["/test".into()]);
    assert_eq!(response.value, RpcValue::from(common::MASTER_URI));

    let response = master.call_node(&uri, "getPid", vec!["/test".into()]);
    assert_eq!(response.value, RpcValue::Int(std::process::id() as i32));

    assert_eq!(master.call_node(&uri, "getBusStats", vec!["/test".into()]).code, 0);
    assert_eq!(master.call_node(&uri, "getBusInfo", vec!["/test".into()]).code, 0);
    assert_eq!(
        master
            .call_node(&uri, "paramUpdate", vec!["/test".into(), "/p".into(), RpcValue::Int(1)])
            .code,
        1
    );
    assert_eq!(master.call_node(&uri, "bogus", vec![]).code, -1);
}

#[test]
fn test_request_topic() {
    let master = FakeMaster::new();
    let node = master.node("talker");
    let _publisher = node.advertise::<String>("/chatter", false).unwrap();
    let uri = node.get_node_uri().to_string();
    let tcpros = || RpcValue::Array(vec![RpcValue::Array(vec!["TCPROS".into()])]);

    let response = master.call_node(
        &uri,
        "requestTopic",
        vec!["/listener".into(), "/chatter".into(), tcpros()],
    );
    assert_eq!(response.code, 1);
    assert_eq!(
        response.value,
        RpcValue::Array(vec![
            "TCPROS".into(),
            "127.0.0.1".into(),
            RpcValue::Int(i32::from(node.topics().port())),
        ])
    );

    let response = master.call_node(
        &uri,
        "requestTopic",
        vec!["/listener".into(), "/other".into(), tcpros()],
    );
    assert_eq!(response.code, 0);

    let udp = RpcValue::Array(vec![RpcValue::Array(vec!["UDPROS".into()])]);
    let response = master.call_node(
        &uri,
        "requestTopic",
        vec!["/listener".into(), "/chatter".into(), udp],
    );
    assert_eq!(response.code, 0);

    let response = master.call_node(&uri, "requestTopic", vec!["/listener".into()]);
    assert_eq!(response.code, -1);
}

#[test]
fn test_remote_shutdown_stops_spin() {
    let master = FakeMaster::new();
    let node = Arc::new(master.node("spinner"));
    let _publisher = node.advertise::<bool>("/alive", false).unwrap();
    let reasons = Arc::new(Mutex::new(Vec::new()));
    {
        let reasons = reasons.clone();
        node.on_shutdown(move |reason| reasons.lock().unwrap().push(reason.to_string()));
    }

    let spinner = {
        let node = node.clone();
        thread::spawn(move || node.spin())
    };
    thread::sleep(Duration::from_millis(50));
    assert!(node.ok());

    let response = master.call_node(node.get_node_uri(), "shutdown", vec!["/master".into()]);
    assert_eq!(response.code, 1);
    spinner.join().unwrap();

    assert!(!node.ok());
    assert!(node.is_shutdown());
    assert_eq!(*reasons.lock().unwrap(), vec![REMOTE_SHUTDOWN.to_string()]);
    assert!(master.publishers("/alive").is_empty());
    assert!(node.advertise::<bool>("/alive", false).is_err());
}

#[test]
fn test_signal_shutdown_is_idempotent() {
    let master = FakeMaster::new();
    let mut node = master.node("stopper");
    let hooks = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let hooks = hooks.clone();
        node.on_shutdown(move |_| {
            hooks.fetch_add(1, Ordering::SeqCst);
        });
    }
    node.on_shutdown(|_| panic!("hooks may fail"));

    assert_eq!(node.get_update_delay_us(), 10_000);
    node.update();
    node.signal_shutdown("first");
    node.signal_shutdown("second");
    Node::shutdown(&mut node);

    assert_eq!(hooks.load(Ordering::SeqCst), 3);
    assert!(node.is_shutdown());
    assert_eq!(
        master.calls_from("/stopper"),
        Vec::<String>::new(),
        "a node without registrations never calls the master"
    );
}

#[test]
fn test_time_helpers() {
    let master = FakeMaster::new();
    let node = master.node("clock");

    assert_eq!(node.get_ip(), DEFAULT_HOST);
    let now = node.get_rostime();
    assert!(now.duration_since(UNIX_EPOCH).unwrap() > Duration::from_secs(1));
    assert!(SystemTime::now() >= now);

    let start = Instant::now();
    node.sleep(Duration::ZERO);
    node.sleep(Duration::from_millis(20));
    assert!(start.elapsed() >= Duration::from_millis(20));

    let mut rate = node.rate(50.0).unwrap();
    assert_eq!(rate.period(), Duration::from_millis(20));
    let start = Instant::now();
    rate.sleep();
    rate.sleep();
    assert!(start.elapsed() >= Duration::from_millis(30));

    assert!(matches!(node.rate(0.0), Err(NodeError::InvalidPeriod(_))));
    assert!(matches!(
        node.create_timer(Duration::ZERO, false, |_| {}),
        Err(NodeError::InvalidPeriod(_))
    ));
}

#[test]
fn test_timers_fire_from_spin_once() {
    let master = FakeMaster::new();
    let node = master.node("ticker");

    let periodic = Arc::new(AtomicUsize::new(0));
    let timer = {
        let periodic = periodic.clone();
        node.create_timer(Duration::from_millis(10), false, move |event| {
            assert!(event.current_real >= event.current_expected);
            periodic.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap()
    };
    let oneshot = Arc::new(AtomicUsize::new(0));
    let once = {
        let oneshot = oneshot.clone();
        node.create_timer(Duration::from_millis(10), true, move |_| {
            oneshot.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap()
    };

    thread::sleep(Duration::from_millis(50));
    assert_eq!(periodic.load(Ordering::SeqCst), 0, "timers only fire while spinning");

    let start = Instant::now();
    while periodic.load(Ordering::SeqCst) < 3 {
        assert!(start.elapsed() < Duration::from_secs(5));
        node.spin_once();
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(oneshot.load(Ordering::SeqCst), 1);
    assert!(!once.is_active());

    timer.shutdown();
    let fired = periodic.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(30));
    node.spin_once();
    assert_eq!(periodic.load(Ordering::SeqCst), fired);

    node.signal_shutdown("done");
    assert!(matches!(
        node.create_timer(Duration::from_millis(10), false, |_| {}),
        Err(NodeError::ShuttingDown)
    ));
}


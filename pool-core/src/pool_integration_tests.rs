use crate::config::PoolConfig;
use crate::daemon::{DaemonEvent, DaemonEventSender};
use crate::error::Error;
use crate::events::{LogLevel, PoolEvent, PoolEventReceiver};
use crate::job_manager::{CurrentJob, JobEvent, JobManager, TemplateJobManager};
use crate::mocks::{
    create_test_job_params, create_test_template, ClientMessage, MockDaemon, MockJobManager, MockStratumClient,
    MockStratumFactory,
};
use crate::pool::{Pool, PoolComponents, PoolHandle};
use crate::server::{ClientEvent, SubmitParams};
use crate::types::{ShareData, ShareResponse, StratumError};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const ADDRESS: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
const TIP: &str = "00000000000000000001b5fb4bd54b4ab6fa4b5c5ab0c41e42d3fb7f1b8a2c3d";

struct TestPool {
    handle: PoolHandle,
    events: PoolEventReceiver,
    daemon: Arc<MockDaemon>,
    daemon_events: DaemonEventSender,
    job_manager: Arc<MockJobManager>,
    factory: Arc<MockStratumFactory>,
    task: JoinHandle<()>,
}

fn create_test_config() -> PoolConfig {
    PoolConfig {
        address: ADDRESS.to_string(),
        block_refresh_interval: 0,
        ..PoolConfig::default()
    }
}

fn create_healthy_daemon() -> Arc<MockDaemon> {
    let daemon = Arc::new(MockDaemon::new());
    daemon.respond("validateaddress", Ok(json!({"isvalid": true, "address": ADDRESS})));
    daemon.respond("submitblock", Ok(Value::Null));
    daemon.respond("getblocktemplate", Ok(serde_json::to_value(create_test_template(TIP, 100)).unwrap()));
    daemon
}

fn create_share_data(block_hash: Option<&str>, error: Option<&str>) -> ShareData {
    ShareData {
        job_id: "1".to_string(),
        ip: "10.0.0.5".to_string(),
        worker: "alice.rig1".to_string(),
        height: 100,
        block_reward: 312_500_000,
        difficulty: 8.0,
        share_diff: 9.5,
        block_diff: 1.0,
        block_hash: block_hash.map(str::to_string),
        error: error.map(str::to_string),
    }
}

fn spawn_test_pool(config: PoolConfig, daemon: Arc<MockDaemon>) -> TestPool {
    let (daemon_tx, daemon_rx) = mpsc::unbounded_channel();
    let (job_manager, job_events) = MockJobManager::new();
    let factory = MockStratumFactory::new();

    let (pool, handle, events) = Pool::new(
        config,
        PoolComponents {
            daemon: daemon.clone(),
            daemon_events: daemon_rx,
            job_manager: job_manager.clone(),
            job_events,
            stratum_factory: factory.clone(),
            authorize: Arc::new(|_, _, _| true),
        },
    );

    TestPool {
        handle,
        events,
        daemon,
        daemon_events: daemon_tx,
        job_manager,
        factory,
        task: tokio::spawn(pool.run()),
    }
}

async fn start_test_pool(config: PoolConfig, daemon: Arc<MockDaemon>) -> TestPool {
    let mut pool = spawn_test_pool(config, daemon);
    pool.daemon_events.send(DaemonEvent::Online).unwrap();
    wait_for_event(&mut pool.events, |e| matches!(e, PoolEvent::Started)).await;
    pool
}

async fn wait_for_event<F>(events: &mut PoolEventReceiver, predicate: F) -> PoolEvent
where
    F: Fn(&PoolEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("pool event stream closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for pool event")
}

fn is_log(expected_level: LogLevel, fragment: &'static str) -> impl Fn(&PoolEvent) -> bool {
    move |event| match event {
        PoolEvent::Log { level, message, .. } => *level == expected_level && message.contains(fragment),
        _ => false,
    }
}

fn is_share(event: &PoolEvent) -> bool {
    matches!(event, PoolEvent::Share { .. })
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

#[tokio::test]
async fn test_bootstrap_starts_server_after_both_probes() {
    let mut pool = spawn_test_pool(create_test_config(), create_healthy_daemon());
    pool.daemon_events.send(DaemonEvent::Online).unwrap();

    wait_for_event(&mut pool.events, is_log(LogLevel::Debug, "Connected to daemon")).await;
    wait_for_event(&mut pool.events, is_log(LogLevel::Debug, "Stratum server starting on port 3333")).await;
    wait_for_event(&mut pool.events, is_log(LogLevel::Debug, "Block template polling has been disabled")).await;
    wait_for_event(&mut pool.events, is_log(LogLevel::Debug, "Stratum server started on port 3333")).await;
    wait_for_event(&mut pool.events, |e| matches!(e, PoolEvent::Started)).await;

    assert_eq!(pool.factory.started_ports(), vec![3333]);
    assert_eq!(pool.daemon.call_count("validateaddress"), 1);
    assert_eq!(pool.daemon.calls().iter().find(|(m, _)| m == "submitblock").unwrap().1, Vec::<Value>::new());
}

#[tokio::test]
async fn test_invalid_address_leaves_pool_unstarted() {
    let daemon = create_healthy_daemon();
    daemon.respond("validateaddress", Ok(json!({"isvalid": false})));
    let mut pool = spawn_test_pool(PoolConfig { block_refresh_interval: 1, ..create_test_config() }, daemon);

    pool.daemon_events.send(DaemonEvent::Online).unwrap();
    wait_for_event(&mut pool.events, is_log(LogLevel::Error, "is not valid")).await;

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(pool.factory.started_ports().is_empty());
    assert_eq!(pool.daemon.call_count("getblocktemplate"), 0);
}

#[tokio::test]
async fn test_validateaddress_error_leaves_pool_unstarted() {
    let daemon = create_healthy_daemon();
    daemon.respond("validateaddress", Err(Error::Network("connection refused".to_string())));
    let mut pool = spawn_test_pool(create_test_config(), daemon);

    pool.daemon_events.send(DaemonEvent::Online).unwrap();
    wait_for_event(&mut pool.events, is_log(LogLevel::Error, "validateaddress rpc error")).await;
    assert!(pool.factory.started_ports().is_empty());
}

#[tokio::test]
async fn test_bootstrap_runs_once() {
    let mut pool = start_test_pool(create_test_config(), create_healthy_daemon()).await;

    pool.daemon_events.send(DaemonEvent::Online).unwrap();
    pool.daemon_events.send(DaemonEvent::Error("work queue depth exceeded".to_string())).unwrap();
    wait_for_event(&mut pool.events, is_log(LogLevel::Error, "work queue depth exceeded")).await;

    assert_eq!(pool.daemon.call_count("validateaddress"), 1);
    assert_eq!(pool.factory.started_ports().len(), 1);
}

#[tokio::test]
async fn test_daemon_start_failure_is_logged() {
    let mut pool = spawn_test_pool(create_test_config(), create_healthy_daemon());

    pool.daemon_events.send(DaemonEvent::StartFailed).unwrap();
    wait_for_event(&mut pool.events, is_log(LogLevel::Error, "Failed to start daemon")).await;
    assert!(!pool.task.is_finished());
}

#[tokio::test]
async fn test_server_start_failure_is_logged() {
    let mut pool = spawn_test_pool(create_test_config(), create_healthy_daemon());
    pool.factory.set_fail_start(true);

    pool.daemon_events.send(DaemonEvent::Online).unwrap();
    wait_for_event(&mut pool.events, is_log(LogLevel::Error, "Failed to start Stratum server on port 3333")).await;

    // The pool stays unstarted: no template is fetched for a notify
    pool.handle.notify_possible_new_block(TIP);
    wait_for_event(&mut pool.events, is_log(LogLevel::Warning, "Ignoring block notify")).await;
    assert_eq!(pool.daemon.call_count("getblocktemplate"), 0);
    assert_eq!(pool.job_manager.templates_processed(), 0);
}

#[tokio::test]
async fn test_new_job_before_server_is_dropped() {
    let mut pool = spawn_test_pool(create_test_config(), create_healthy_daemon());

    pool.job_manager.emit(JobEvent::NewJob(create_test_job_params("1")));
    wait_for_event(&mut pool.events, is_log(LogLevel::Warning, "Stratum server still not started")).await;
    assert!(pool.factory.broadcasts().is_empty());
}

#[tokio::test]
async fn test_new_job_is_broadcast() {
    let mut pool = start_test_pool(create_test_config(), create_healthy_daemon()).await;

    pool.job_manager.emit(JobEvent::NewJob(create_test_job_params("2a")));
    wait_for_event(&mut pool.events, is_log(LogLevel::Debug, "Detected new block")).await;

    let factory = pool.factory.clone();
    wait_until(move || factory.broadcasts().len() == 1).await;
    assert_eq!(pool.factory.broadcasts()[0].job_id, "2a");
}

#[tokio::test]
async fn test_share_without_block_needs_no_rpc() {
    let mut pool = start_test_pool(create_test_config(), create_healthy_daemon()).await;
    let calls_before = pool.daemon.calls().len();

    pool.job_manager.emit(JobEvent::Share { data: create_share_data(None, None), block_hex: None });
    pool.job_manager.emit(JobEvent::Share { data: create_share_data(None, Some("duplicate share")), block_hex: None });

    match wait_for_event(&mut pool.events, is_share).await {
        PoolEvent::Share { valid_share, valid_block, .. } => {
            assert!(valid_share);
            assert!(!valid_block);
        }
        other => panic!("unexpected event {:?}", other),
    }
    match wait_for_event(&mut pool.events, is_share).await {
        PoolEvent::Share { valid_share, valid_block, data } => {
            assert!(!valid_share);
            assert!(!valid_block);
            assert_eq!(data.error.as_deref(), Some("duplicate share"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(pool.daemon.calls().len(), calls_before);
}

#[tokio::test]
async fn test_block_accepted_when_hash_matches() {
    let daemon = create_healthy_daemon();
    daemon.respond("getblock", Ok(json!({"hash": "deadbeef", "height": 100})));
    let mut pool = start_test_pool(create_test_config(), daemon).await;

    pool.job_manager.emit(JobEvent::Share {
        data: create_share_data(Some("deadbeef"), None),
        block_hex: Some("00ff".to_string()),
    });

    match wait_for_event(&mut pool.events, is_share).await {
        PoolEvent::Share { valid_share, valid_block, data } => {
            assert!(valid_share);
            assert!(valid_block);
            assert_eq!(data.block_hash.as_deref(), Some("deadbeef"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    let calls = pool.daemon.calls();
    let tail = &calls[calls.len() - 2..];
    assert_eq!(tail[0], ("submitblock".to_string(), vec![json!("00ff")]));
    assert_eq!(tail[1], ("getblock".to_string(), vec![json!("deadbeef")]));
}

#[tokio::test]
async fn test_block_rejected_when_hash_differs() {
    let daemon = create_healthy_daemon();
    daemon.respond("getblock", Ok(json!({"hash": "cafebabe"})));
    let mut pool = start_test_pool(create_test_config(), daemon).await;

    pool.job_manager.emit(JobEvent::Share {
        data: create_share_data(Some("deadbeef"), None),
        block_hex: Some("00ff".to_string()),
    });

    match wait_for_event(&mut pool.events, is_share).await {
        PoolEvent::Share { valid_share, valid_block, .. } => {
            assert!(valid_share);
            assert!(!valid_block);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_block_rejected_when_lookup_fails() {
    let daemon = create_healthy_daemon();
    daemon.respond("getblock", Err(Error::Rpc { code: -5, message: "Block not found".to_string() }));
    let mut pool = start_test_pool(create_test_config(), daemon).await;

    pool.job_manager.emit(JobEvent::Share {
        data: create_share_data(Some("deadbeef"), None),
        block_hex: Some("00ff".to_string()),
    });

    match wait_for_event(&mut pool.events, is_share).await {
        PoolEvent::Share { valid_share, valid_block, .. } => {
            assert!(valid_share);
            assert!(!valid_block);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_submit_error_still_confirms() {
    let daemon = create_healthy_daemon();
    daemon.respond("submitblock", Err(Error::Network("connection reset".to_string())));
    daemon.respond("getblock", Ok(json!({"hash": "deadbeef"})));
    let mut pool = start_test_pool(create_test_config(), daemon).await;

    pool.job_manager.emit(JobEvent::Share {
        data: create_share_data(Some("deadbeef"), None),
        block_hex: Some("00ff".to_string()),
    });

    wait_for_event(&mut pool.events, is_log(LogLevel::Error, "rpc error when submitting block with submitblock")).await;
    match wait_for_event(&mut pool.events, is_share).await {
        PoolEvent::Share { valid_block, .. } => assert!(valid_block),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(pool.daemon.methods().last().map(String::as_str), Some("getblock"));
}

#[tokio::test]
async fn test_missing_submitblock_falls_back_to_getblocktemplate() {
    let daemon = create_healthy_daemon();
    daemon.respond("submitblock", Err(Error::Rpc { code: -32601, message: "Method not found".to_string() }));
    daemon.respond("getblock", Ok(json!({"hash": "deadbeef"})));
    let mut pool = start_test_pool(create_test_config(), daemon).await;

    pool.job_manager.emit(JobEvent::Share {
        data: create_share_data(Some("deadbeef"), None),
        block_hex: Some("00ff".to_string()),
    });

    wait_for_event(&mut pool.events, is_log(LogLevel::Debug, "Submitted Block using getblocktemplate")).await;
    wait_for_event(&mut pool.events, is_share).await;

    let calls = pool.daemon.calls();
    assert_eq!(calls.iter().filter(|(m, _)| m == "submitblock").count(), 1);
    assert!(calls.contains(&(
        "getblocktemplate".to_string(),
        vec![json!({"mode": "submit", "data": "00ff"})],
    )));
}

#[tokio::test]
async fn test_block_notify_skips_current_tip() {
    let pool = start_test_pool(create_test_config(), create_healthy_daemon()).await;
    pool.job_manager.set_current_job(Some(CurrentJob::new(create_test_job_params("1"), TIP)));

    pool.handle.notify_possible_new_block(TIP);
    pool.handle.notify_possible_new_block("0000000000000000000320283a032748cef8227873ff4872689bf23f1cda83a5");

    let job_manager = pool.job_manager.clone();
    wait_until(move || job_manager.templates_processed() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(pool.daemon.call_count("getblocktemplate"), 1);
    assert_eq!(
        pool.daemon.calls().iter().find(|(m, _)| m == "getblocktemplate").unwrap().1,
        vec![json!({"capabilities": ["coinbasetxn", "workid", "coinbase/append"]})]
    );
}

#[tokio::test]
async fn test_block_notify_error_is_logged() {
    let daemon = create_healthy_daemon();
    let mut pool = start_test_pool(create_test_config(), daemon).await;
    pool.daemon.respond("getblocktemplate", Err(Error::Network("timeout".to_string())));

    pool.handle.notify_possible_new_block(TIP);
    wait_for_event(&mut pool.events, is_log(LogLevel::Error, "Block notify error getting block template for pool")).await;
}

#[tokio::test]
async fn test_block_notify_before_start_is_ignored() {
    let mut pool = spawn_test_pool(create_test_config(), create_healthy_daemon());

    pool.handle.notify_possible_new_block(TIP);
    wait_for_event(&mut pool.events, is_log(LogLevel::Warning, "before the pool has started")).await;
    assert_eq!(pool.daemon.call_count("getblocktemplate"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_polling_fetches_on_interval() {
    let config = PoolConfig { block_refresh_interval: 2, ..create_test_config() };
    let pool = start_test_pool(config, create_healthy_daemon()).await;

    tokio::time::sleep(Duration::from_millis(1_900)).await;
    assert_eq!(pool.daemon.call_count("getblocktemplate"), 0);

    tokio::time::sleep(Duration::from_millis(4_200)).await;
    assert_eq!(pool.daemon.call_count("getblocktemplate"), 3);
    assert_eq!(pool.job_manager.templates_processed(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_zero_interval_never_polls() {
    let pool = start_test_pool(create_test_config(), create_healthy_daemon()).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(pool.daemon.call_count("getblocktemplate"), 0);
}

#[tokio::test]
async fn test_subscribe_without_job_warns() {
    let mut pool = start_test_pool(create_test_config(), create_healthy_daemon()).await;
    let client = MockStratumClient::new("10.0.0.5");
    let client_events = pool.factory.connect(client.clone()).unwrap();

    client_events.send(client.subscription()).unwrap();
    wait_for_event(&mut pool.events, is_log(LogLevel::Warning, "A miner subscribed but no job to dispatch!")).await;

    assert_eq!(
        client.messages(),
        vec![
            ClientMessage::SubscribeReply { extra_nonce1: "08000001".to_string(), extra_nonce2_size: 4 },
            ClientMessage::Difficulty(8.0),
        ]
    );
}

#[tokio::test]
async fn test_subscribe_receives_current_job() {
    let pool = start_test_pool(create_test_config(), create_healthy_daemon()).await;
    pool.job_manager.set_current_job(Some(CurrentJob::new(create_test_job_params("7"), TIP)));
    let client = MockStratumClient::new("10.0.0.5");
    let client_events = pool.factory.connect(client.clone()).unwrap();

    client_events.send(client.subscription()).unwrap();
    let observed = client.clone();
    wait_until(move || observed.messages().len() == 3).await;

    let messages = client.messages();
    assert!(matches!(messages[0], ClientMessage::SubscribeReply { .. }));
    assert_eq!(messages[1], ClientMessage::Difficulty(8.0));
    assert_eq!(messages[2], ClientMessage::Job(create_test_job_params("7")));

    // Difficulty is only pushed when it changes
    client_events.send(client.subscription()).unwrap();
    let observed = client.clone();
    wait_until(move || observed.messages().len() == 5).await;
    assert_eq!(client.messages().iter().filter(|m| matches!(m, ClientMessage::Difficulty(_))).count(), 1);
}

#[tokio::test]
async fn test_submit_assembles_share_from_connection() {
    let pool = start_test_pool(create_test_config(), create_healthy_daemon()).await;
    let client = MockStratumClient::new("10.0.0.5");
    let client_events = pool.factory.connect(client.clone()).unwrap();

    client_events.send(client.subscription()).unwrap();
    pool.job_manager.set_share_response(ShareResponse::rejected(StratumError::job_not_found()));
    client_events
        .send(client.submit(SubmitParams {
            worker: "alice.rig1".to_string(),
            job_id: "ff".to_string(),
            extra_nonce2: "00000001".to_string(),
            ntime: "65a1b2c3".to_string(),
            nonce: "0000abcd".to_string(),
        }))
        .unwrap();

    let observed = client.clone();
    wait_until(move || observed.messages().iter().any(|m| matches!(m, ClientMessage::SubmitReply { .. }))).await;

    let reply = client.messages().into_iter().find(|m| matches!(m, ClientMessage::SubmitReply { .. })).unwrap();
    assert_eq!(reply, ClientMessage::SubmitReply { error: Some(StratumError::job_not_found()), accepted: false });

    let share = &pool.job_manager.shares()[0];
    assert_eq!(share.job_id, "ff");
    assert_eq!(share.difficulty, 8.0);
    assert_eq!(share.extra_nonce1, "08000001");
    assert_eq!(share.ip, "10.0.0.5");
    assert_eq!(share.worker, "alice.rig1");
}

#[tokio::test]
async fn test_accepted_submit_replies_true() {
    let pool = start_test_pool(create_test_config(), create_healthy_daemon()).await;
    let client = MockStratumClient::new("10.0.0.6");
    let client_events = pool.factory.connect(client.clone()).unwrap();

    client_events.send(client.subscription()).unwrap();
    client_events
        .send(client.submit(SubmitParams {
            worker: "bob".to_string(),
            job_id: "1".to_string(),
            extra_nonce2: "00000002".to_string(),
            ntime: "65a1b2c3".to_string(),
            nonce: "00000001".to_string(),
        }))
        .unwrap();

    let observed = client.clone();
    wait_until(move || observed.messages().contains(&ClientMessage::SubmitReply { error: None, accepted: true })).await;
}

#[tokio::test]
async fn test_connection_errors_are_logged() {
    let mut pool = start_test_pool(create_test_config(), create_healthy_daemon()).await;
    let client = MockStratumClient::new("10.0.0.5");
    client.set_worker_name("alice.rig1");
    let client_events = pool.factory.connect(client.clone()).unwrap();

    client_events.send(ClientEvent::MalformedMessage("{garbage".to_string())).unwrap();
    wait_for_event(&mut pool.events, is_log(LogLevel::Warning, "alice.rig1 has sent us a malformed message: {garbage")).await;

    client_events.send(ClientEvent::SocketError("connection reset by peer".to_string())).unwrap();
    wait_for_event(&mut pool.events, is_log(LogLevel::Warning, "alice.rig1 has somehow had a socket error")).await;

    client_events.send(ClientEvent::UnknownStratumMethod("mining.suggest_target".to_string())).unwrap();
    wait_for_event(&mut pool.events, is_log(LogLevel::Debug, "unknown stratum method: mining.suggest_target")).await;

    client_events.send(ClientEvent::SocketDisconnect).unwrap();
    wait_for_event(&mut pool.events, is_log(LogLevel::Debug, "Client 'alice.rig1' disconnected!")).await;
}

#[tokio::test]
async fn test_template_refresh_reaches_miners() {
    let daemon = create_healthy_daemon();
    let (daemon_tx, daemon_rx) = mpsc::unbounded_channel();
    let (job_manager, job_events) = TemplateJobManager::new(Default::default());
    let job_manager = Arc::new(job_manager);
    let factory = MockStratumFactory::new();

    let (pool, handle, mut events) = Pool::new(
        create_test_config(),
        PoolComponents {
            daemon: daemon.clone(),
            daemon_events: daemon_rx,
            job_manager: job_manager.clone(),
            job_events,
            stratum_factory: factory.clone(),
            authorize: Arc::new(|_, _, _| true),
        },
    );
    tokio::spawn(pool.run());

    daemon_tx.send(DaemonEvent::Online).unwrap();
    wait_for_event(&mut events, |e| matches!(e, PoolEvent::Started)).await;

    handle.notify_possible_new_block(TIP);
    wait_for_event(&mut events, is_log(LogLevel::Debug, "Detected new block")).await;

    let observed = factory.clone();
    wait_until(move || observed.broadcasts().len() == 1).await;
    let current = job_manager.current_job().await.unwrap();
    assert_eq!(current.previous_block_hash(), TIP);
    assert_eq!(factory.broadcasts()[0], current.job_params());

    // The same tip again is a duplicate notification
    handle.notify_possible_new_block(TIP);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(daemon.call_count("getblocktemplate"), 1);
}

#[tokio::test]
async fn test_shutdown_stops_server() {
    let pool = start_test_pool(create_test_config(), create_healthy_daemon()).await;

    pool.handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), pool.task).await.unwrap().unwrap();
    assert!(pool.factory.is_shut_down());
}

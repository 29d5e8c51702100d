//! Connection loss, retry and resubscription.

mod common;

use common::{test_config, wait_until, Recorder};
use pg_hub::{Action, Hub, HubError, MemoryPool};
use std::time::Duration;

#[tokio::test]
async fn test_resubscribes_after_connection_loss() {
    let pool = MemoryPool::new();
    let hub = Hub::new(pool.clone(), test_config("resync"));
    let recorder = Recorder::new();
    recorder.attach(&hub).subscribe_all(["beta", "alpha"]).unwrap();

    assert!(hub.start().await);
    wait_until("listens", || hub.stats().listens == 3).await;

    pool.sever_all();
    wait_until("reconnect event", || recorder.count(Action::Reconnect) == 1).await;
    wait_until("listens after reconnect", || hub.stats().listens == 6).await;

    let sessions = pool.executed();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[1], vec![
        "unlisten *".to_string(),
        "listen \"alpha\"".to_string(),
        "listen \"beta\"".to_string(),
    ]);
    assert_eq!(pool.session_count(), 1);
    assert_eq!(pool.listener_count("alpha"), 1);

    assert_eq!(recorder.actions(), vec![
        Action::Subscribe,
        Action::Subscribe,
        Action::Connect,
        Action::Disconnect,
        Action::Reconnect,
    ]);

    let stats = hub.stats();
    assert_eq!(stats.connect, 2);
    assert_eq!(stats.connect_loss, 1);

    hub.notify("alpha", &[1u64], &"after").unwrap();
    wait_until("delivery", || recorder.data().len() == 1).await;
}

#[tokio::test]
async fn test_ordering_across_reconnects() {
    const COUNT: u64 = 300;

    let pool = MemoryPool::new();
    let hub = Hub::new(pool.clone(), test_config("ordering"));
    let recorder = Recorder::new();
    recorder.attach(&hub).subscribe("seq").unwrap();
    assert!(hub.start().await);

    let mut accepted = Vec::new();
    for n in 0..COUNT {
        match hub.notify("seq", &[n], &n) {
            Ok(()) => accepted.push(n),
            Err(HubError::NotReady) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
        if n == COUNT / 3 {
            pool.sever_all();
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let last = *accepted.last().unwrap();
    wait_until("last accepted event", || recorder.first_keys().contains(&last)).await;

    let received = recorder.first_keys();
    assert!(received.windows(2).all(|w| w[0] <= w[1]), "keys out of order: {received:?}");

    let mut distinct = received.clone();
    distinct.dedup();
    assert_eq!(distinct, accepted);
    assert_eq!(hub.stats().connect_loss, 1);
}

#[tokio::test(start_paused = true)]
async fn test_retries_until_connected() {
    let pool = MemoryPool::new();
    pool.fail_next_connects(3);
    let hub = Hub::new(pool.clone(), test_config("retry"));

    assert!(hub.start().await);

    let stats = hub.stats();
    assert_eq!(stats.connect_fail, 3);
    assert_eq!(stats.connect, 1);
    assert_eq!(pool.connect_attempts(), 4);
}

#[tokio::test]
async fn test_failed_statement_is_retried() {
    let pool = MemoryPool::new();
    let hub = Hub::new(pool.clone(), test_config("query_failure"));
    let recorder = Recorder::new();
    recorder.attach(&hub).subscribe("orders").unwrap();

    assert!(hub.start().await);
    wait_until("listens", || hub.stats().listens == 2).await;

    pool.fail_next_queries(1);
    hub.notify("orders", &[7u64], &"retried").unwrap();

    wait_until("delivery", || recorder.data().len() == 1).await;
    assert_eq!(recorder.first_keys(), vec![7]);

    let stats = hub.stats();
    assert_eq!(stats.connect_loss, 1);
    assert_eq!(stats.sent, 1);
    assert_eq!(recorder.count(Action::Disconnect), 1);
    assert_eq!(recorder.count(Action::Reconnect), 1);
}

#[tokio::test]
async fn test_notify_rejected_while_reconnecting() {
    let pool = MemoryPool::new();
    let hub = Hub::new(pool.clone(), test_config("not_ready"));
    let recorder = Recorder::new();
    recorder.attach(&hub).subscribe("orders").unwrap();
    assert!(hub.start().await);

    pool.fail_next_connects(usize::MAX);
    pool.sever_all();
    wait_until("connection loss", || hub.stats().connect_loss == 1).await;
    wait_until("failed retry", || hub.stats().connect_fail >= 1).await;

    assert_eq!(hub.notify("orders", &[1u64], &()), Err(HubError::NotReady));
    assert!(HubError::NotReady.is_transient());

    pool.fail_next_connects(0);
    wait_until("reconnect event", || recorder.count(Action::Reconnect) == 1).await;

    hub.notify("orders", &[2u64], &()).unwrap();
    wait_until("delivery", || recorder.data().len() == 1).await;
    assert_eq!(recorder.first_keys(), vec![2]);
}

#[tokio::test]
async fn test_stop_while_waiting_to_reconnect() {
    let pool = MemoryPool::new();
    let hub = Hub::new(pool.clone(), test_config("stop_waiting"));
    let recorder = Recorder::new();
    recorder.attach(&hub).subscribe("orders").unwrap();
    assert!(hub.start().await);

    pool.fail_next_connects(usize::MAX);
    pool.sever_all();
    wait_until("failed retry", || hub.stats().connect_fail >= 1).await;

    assert!(hub.stop().await);
    wait_until("stop event", || recorder.count(Action::Stop) == 1).await;

    let attempts = pool.connect_attempts();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.connect_attempts(), attempts, "no retries after stop");
    assert_eq!(pool.session_count(), 0);
}

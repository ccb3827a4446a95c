//! Push daemon against a scripted local collector.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use organ_bridge::gateway::Secret;
use organ_bridge::pacer::ManualPacer;
use organ_bridge::push::*;
use organ_bridge::state::MemoryStateStore;
use organ_bridge::web::read_request;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    authorization: Option<String>,
    body: serde_json::Value,
}

struct Collector {
    base: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl Collector {
    fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    async fn wait_for(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.count() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("collector never saw {n} requests"));
    }
}

/// Answers the i-th request with `statuses[i]` (the last entry repeats).
async fn spawn_collector(statuses: Vec<u16>) -> Collector {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let requests = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&requests);

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(req) = read_request(&mut stream).await else {
                continue;
            };
            let index = {
                let mut guard = log.lock().unwrap();
                guard.push(Recorded {
                    method: req.method.clone(),
                    path: req.path.clone(),
                    authorization: req.header("authorization").map(str::to_string),
                    body: serde_json::from_slice(&req.body).unwrap_or(serde_json::Value::Null),
                });
                guard.len() - 1
            };
            let status = statuses
                .get(index)
                .or(statuses.last())
                .copied()
                .unwrap_or(200);
            let resp = format!("HTTP/1.1 {status} Scripted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            let _ = stream.write_all(resp.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });

    Collector { base, requests }
}

fn store_with(value: serde_json::Value) -> Arc<MemoryStateStore> {
    let store = Arc::new(MemoryStateStore::new());
    store.set_snapshot(&value);
    store
}

#[tokio::test]
async fn test_failed_cycle_does_not_stop_next_cycle() {
    let collector = spawn_collector(vec![500, 200]).await;
    let daemon = PushDaemon::builder(Some(collector.base.clone()))
        .store(store_with(serde_json::json!({"nodes": 5})))
        .token(Secret::new("tok"))
        .build()
        .unwrap();

    let (handle, pacer) = ManualPacer::new();
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(daemon.run(pacer, rx));

    handle.advance();
    collector.wait_for(1).await;
    handle.advance();
    collector.wait_for(2).await;

    tx.send(true).unwrap();
    let stats = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.cycles, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.delivered, 1);
}

#[tokio::test]
async fn test_push_carries_snapshot_and_bearer_token() {
    let collector = spawn_collector(vec![200]).await;
    let daemon = PushDaemon::builder(Some(format!("{}/", collector.base)))
        .store(store_with(serde_json::json!({"nodes": 5, "organs": {"heart": "ok"}})))
        .token(Secret::new("tok"))
        .build()
        .unwrap();

    let result = daemon.push_once().await;
    assert!(matches!(result, PushCycleResult::Delivered { status: 200 }), "{result:?}");

    let reqs = collector.requests();
    assert_eq!(reqs.len(), 1);
    assert_eq!(reqs[0].method, "POST");
    assert_eq!(reqs[0].path, WEBHOOK_PATH);
    assert_eq!(reqs[0].authorization.as_deref(), Some("Bearer tok"));
    assert_eq!(reqs[0].body, serde_json::json!({"nodes": 5, "organs": {"heart": "ok"}}));
}

#[tokio::test]
async fn test_non_2xx_is_http_failure() {
    let collector = spawn_collector(vec![503]).await;
    let daemon = PushDaemon::builder(Some(collector.base.clone()))
        .store(store_with(serde_json::json!({"nodes": 1})))
        .build()
        .unwrap();
    match daemon.push_once().await {
        PushCycleResult::Failed(PushError::Http { status, .. }) => assert_eq!(status, 503),
        other => panic!("expected HTTP failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_offline_snapshot_makes_no_request() {
    let collector = spawn_collector(vec![200]).await;
    let daemon = PushDaemon::builder(Some(collector.base.clone()))
        .store(Arc::new(MemoryStateStore::new()))
        .build()
        .unwrap();
    assert!(matches!(daemon.push_once().await, PushCycleResult::Offline { .. }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(collector.count(), 0);
}

#[tokio::test]
async fn test_torn_snapshot_makes_no_request() {
    let collector = spawn_collector(vec![200]).await;
    let store = Arc::new(MemoryStateStore::new());
    store.set_snapshot_raw(Some(br#"{"nodes": 5, "org"#));
    let daemon = PushDaemon::builder(Some(collector.base.clone()))
        .store(store)
        .build()
        .unwrap();
    assert!(matches!(daemon.push_once().await, PushCycleResult::Offline { .. }));
    assert_eq!(collector.count(), 0);
}

#[tokio::test]
async fn test_stalled_collector_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let daemon = PushDaemon::builder(Some(base))
        .store(store_with(serde_json::json!({"nodes": 1})))
        .request_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), daemon.push_once())
        .await
        .expect("client timeout bounds the cycle");
    assert!(
        matches!(result, PushCycleResult::Failed(PushError::Timeout { .. })),
        "{result:?}"
    );
}

#[tokio::test]
async fn test_spawned_daemon_pushes_on_interval() {
    let collector = spawn_collector(vec![200]).await;
    let daemon = PushDaemon::builder(Some(collector.base.clone()))
        .store(store_with(serde_json::json!({"nodes": 2})))
        .interval(Duration::from_millis(50))
        .build()
        .unwrap();

    let (tx, rx) = watch::channel(false);
    let handle = daemon.spawn(rx);
    collector.wait_for(3).await;
    tx.send(true).unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(stats.delivered >= 3, "{stats:?}");
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn test_disabled_daemon_returns_at_once() {
    let daemon = PushDaemon::builder(None)
        .store(Arc::new(MemoryStateStore::new()))
        .build()
        .unwrap();
    let (_tx, rx) = watch::channel(false);
    let stats = tokio::time::timeout(Duration::from_secs(1), daemon.spawn(rx))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.cycles, 0);
}

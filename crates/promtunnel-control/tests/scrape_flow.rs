//! Caller/agent interplay through the shared queue and correlation table

use std::sync::Arc;
use std::time::Duration;

use promtunnel_control::{
    CorrelationTable, FulfilOutcome, ScrapeBridge, ScrapeDispatcher, ScrapeError,
};
use promtunnel_proto::ScrapeResult;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn core() -> ScrapeBridge {
    ScrapeBridge::new(
        Arc::new(CorrelationTable::new()),
        Arc::new(ScrapeDispatcher::new()),
    )
}

async fn wait_for_queue(bridge: &ScrapeBridge, len: usize) {
    timeout(Duration::from_secs(2), async {
        while bridge.dispatcher().len() < len {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("requests should reach the queue");
}

#[tokio::test]
async fn test_two_agents_out_of_order_completion() {
    let bridge = core();

    // Callers submit r1, r2, r3 in that order
    let mut callers = Vec::new();
    for (i, name) in ["foo", "bar", "baz"].into_iter().enumerate() {
        let bridge_clone = bridge.clone();
        callers.push(tokio::spawn(async move {
            bridge_clone.submit(name, Duration::from_secs(5)).await
        }));
        wait_for_queue(&bridge, i + 1).await;
    }

    let agent_a = CancellationToken::new();
    let agent_b = CancellationToken::new();
    let dispatcher = bridge.dispatcher();

    let r1 = dispatcher.dequeue(&agent_a).await.unwrap();
    let r2 = dispatcher.dequeue(&agent_b).await.unwrap();
    let r3 = dispatcher.dequeue(&agent_a).await.unwrap();
    assert_eq!(
        (r1.name.as_str(), r2.name.as_str(), r3.name.as_str()),
        ("foo", "bar", "baz")
    );
    assert!(r1.id < r2.id && r2.id < r3.id);

    let table = bridge.table();
    assert_eq!(
        table.fulfil(ScrapeResult::success(r2.id, "BAR_DATA")),
        FulfilOutcome::Delivered
    );
    assert_eq!(
        table.fulfil(ScrapeResult::success(r1.id, "FOO_DATA")),
        FulfilOutcome::Delivered
    );
    assert_eq!(
        table.fulfil(ScrapeResult::success(r3.id, "BAZ_DATA")),
        FulfilOutcome::Delivered
    );

    let payloads: Vec<String> = futures::future::join_all(callers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().text())
        .collect();
    assert_eq!(payloads, vec!["FOO_DATA", "BAR_DATA", "BAZ_DATA"]);
    assert_eq!(table.anomaly_count(), 0);
}

#[tokio::test]
async fn test_expiry_with_no_agents() {
    let bridge = core();
    let started = tokio::time::Instant::now();

    let result = timeout(
        Duration::from_secs(2),
        bridge.submit("x", Duration::from_millis(100)),
    )
    .await
    .expect("submit must not hang");

    let elapsed = started.elapsed();
    assert!(matches!(result, Err(ScrapeError::Expired { .. })));
    assert!(elapsed >= Duration::from_millis(100), "expired early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "expired late: {:?}", elapsed);
}

#[tokio::test]
async fn test_late_result_after_expiry_is_discarded() {
    let bridge = core();

    let expired = bridge.submit("slow", Duration::from_millis(50)).await;
    assert!(matches!(expired, Err(ScrapeError::Expired { .. })));

    // An agent picks the stale request up afterwards
    let cancel = CancellationToken::new();
    let stale = bridge.dispatcher().dequeue(&cancel).await.unwrap();

    let live = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.submit("fast", Duration::from_secs(5)).await })
    };
    let fresh = bridge.dispatcher().dequeue(&cancel).await.unwrap();

    assert_eq!(
        bridge.table().fulfil(ScrapeResult::success(stale.id, "STALE")),
        FulfilOutcome::UnknownId
    );
    bridge
        .table()
        .fulfil(ScrapeResult::success(fresh.id, "FRESH"));

    assert_eq!(live.await.unwrap().unwrap().text(), "FRESH");
    assert_eq!(bridge.table().anomaly_count(), 1);
}

#[tokio::test]
async fn test_shutdown_releases_two_waiting_callers() {
    let bridge = core();
    let callers: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|name| {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.submit(name, Duration::from_secs(60)).await })
        })
        .collect();
    wait_for_queue(&bridge, 2).await;

    bridge.dispatcher().close();
    bridge.table().close();

    for caller in callers {
        let result = timeout(Duration::from_secs(1), caller)
            .await
            .expect("caller must be released")
            .unwrap();
        assert_eq!(result, Err(ScrapeError::DispatcherClosed));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_cross_delivery_under_concurrency() {
    let bridge = core();
    let n = 200;

    // Three agents answer with the name they were asked for, each after a
    // delay that varies per request so completion order is scrambled
    let stop = CancellationToken::new();
    let agents: Vec<_> = (0..3)
        .map(|_| {
            let bridge = bridge.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                while let Ok(request) = bridge.dispatcher().dequeue(&stop).await {
                    let bridge = bridge.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(request.id % 7)).await;
                        let payload = format!("{}#{}", request.name, request.id);
                        bridge
                            .table()
                            .fulfil(ScrapeResult::success(request.id, payload));
                    });
                }
            })
        })
        .collect();

    let callers: Vec<_> = (0..n)
        .map(|i| {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                let name = format!("target-{}", i);
                let result = bridge.submit(&name, Duration::from_secs(10)).await;
                (name, result)
            })
        })
        .collect();

    for caller in callers {
        let (name, result) = timeout(Duration::from_secs(15), caller)
            .await
            .unwrap()
            .unwrap();
        let result = result.unwrap();
        let text = result.text();
        let (got_name, got_id) = text.split_once('#').unwrap();
        assert_eq!(got_name, name);
        assert_eq!(got_id.parse::<u64>().unwrap(), result.id);
    }

    stop.cancel();
    for agent in agents {
        agent.await.unwrap();
    }
    assert_eq!(bridge.table().anomaly_count(), 0);
}

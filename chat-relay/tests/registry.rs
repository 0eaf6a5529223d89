use std::{collections::HashSet, sync::Arc};

use chat_relay::{
    hub::{BroadcastHub, SelfDelivery},
    message::Message,
    registry::ConnectionRegistry,
};
use tokio::sync::mpsc;

const CLIENTS: usize = 64;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_are_all_recorded() {
    let registry = Arc::new(ConnectionRegistry::new());
    let mut tasks = Vec::new();
    let mut receivers = Vec::new();

    for n in 0..CLIENTS {
        let (tx, rx) = mpsc::channel::<Message>(1);
        receivers.push(rx);
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            registry
                .register(format!("client-{n}"), tx)
                .await
                .expect("register")
        }));
    }

    let mut ids = HashSet::new();
    for task in tasks {
        ids.insert(task.await.expect("task"));
    }

    assert_eq!(ids.len(), CLIENTS);
    assert_eq!(registry.len().await, CLIENTS);
    let snapshot_ids: HashSet<_> = registry
        .snapshot()
        .await
        .iter()
        .map(|connection| connection.id())
        .collect();
    assert_eq!(snapshot_ids, ids);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_unregister_and_broadcast_leave_registry_consistent() {
    let hub = Arc::new(BroadcastHub::new(ConnectionRegistry::new(), SelfDelivery::Include));
    let mut ids = Vec::new();
    let mut receivers = Vec::new();

    for n in 0..CLIENTS {
        let (tx, rx) = mpsc::channel(CLIENTS);
        let (id, _) = hub
            .connect(Some(format!("client-{n}")), tx)
            .await
            .expect("connect");
        ids.push(id);
        receivers.push(rx);
    }

    let leavers: Vec<_> = ids.iter().copied().step_by(2).collect();
    let speaker = ids[1];

    let unregister = {
        let hub = Arc::clone(&hub);
        let leavers = leavers.clone();
        tokio::spawn(async move {
            for id in leavers {
                hub.disconnect(id).await;
                // Twice, as a racing disconnect notification would.
                hub.disconnect(id).await;
            }
        })
    };
    let broadcasts = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            for round in 0..16 {
                hub.broadcast(speaker, format!("round {round}"))
                    .await
                    .expect("broadcast");
            }
        })
    };

    unregister.await.expect("unregister task");
    broadcasts.await.expect("broadcast task");

    assert_eq!(hub.registry().len().await, CLIENTS - leavers.len());

    // Connections that stayed for the whole run saw every round, in order.
    for (index, receiver) in receivers.iter_mut().enumerate() {
        if index % 2 == 0 {
            continue;
        }
        for round in 0..16 {
            let message = receiver.try_recv().expect("stayer receives every round");
            assert_eq!(message.body, format!("round {round}"));
        }
    }
}

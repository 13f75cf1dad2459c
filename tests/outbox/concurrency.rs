//! Several dispatchers over one outbox.

use std::collections::HashSet;
use std::thread;
use std::time::{Duration, Instant};

use motionit_outbox::channel::OUTBOX_ID_HEADER;
use motionit_outbox::{
    ChannelRelay, DispatcherThread, HandlerRegistry, InMemoryChannel, NewOutboxEvent,
    OutboxDispatcher, OutboxStatus, OutboxStore,
};

use crate::support::App;

const TOPIC: &str = "/topic/challenge/relay";

fn enqueue(app: &App, count: u64) {
    let mut tx = app.manager.begin();
    for room_id in 1..=count {
        tx.enqueue(NewOutboxEvent::new("ROOM_CHANGED", "ChallengeRoom", room_id, "{}"));
    }
    tx.commit().unwrap();
}

fn dispatcher(app: &App, worker: &str, relay: &InMemoryChannel) -> OutboxDispatcher<motionit_outbox::InMemoryStore> {
    OutboxDispatcher::new(
        app.store().clone(),
        HandlerRegistry::new().with("ROOM_CHANGED", ChannelRelay::new(TOPIC, relay.clone())),
    )
    .with_worker_id(worker)
    .with_batch_size(25)
}

#[test]
fn competing_dispatchers_deliver_each_row_once() {
    let app = App::new();
    enqueue(&app, 300);
    let relay = InMemoryChannel::new();

    let workers: Vec<_> = (0..4)
        .map(|n| {
            let dispatcher = dispatcher(&app, &format!("worker-{n}"), &relay);
            thread::spawn(move || {
                let mut sent = 0;
                loop {
                    let report = dispatcher.poll_and_dispatch().unwrap();
                    if report.loaded == 0 {
                        return sent;
                    }
                    sent += report.sent;
                }
            })
        })
        .collect();
    let sent: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();

    assert_eq!(sent, 300);
    assert_eq!(app.store().count_by_status(OutboxStatus::Sent).unwrap(), 300);
    let messages = relay.on_topic(TOPIC);
    assert_eq!(messages.len(), 300);
    let ids: HashSet<&str> = messages
        .iter()
        .filter_map(|m| m.header(OUTBOX_ID_HEADER))
        .collect();
    assert_eq!(ids.len(), 300);
}

#[test]
fn background_thread_delivers_rows_committed_while_it_runs() {
    let app = App::new();
    let relay = InMemoryChannel::new();
    let subscription = relay.subscribe(TOPIC);
    let worker = DispatcherThread::spawn(
        dispatcher(&app, "background", &relay),
        Duration::from_millis(5),
    );

    enqueue(&app, 10);
    let first = subscription.poll(Duration::from_secs(5));
    assert!(first.is_some(), "no message relayed");
    enqueue(&app, 10);

    let deadline = Instant::now() + Duration::from_secs(5);
    while app.store().count_by_status(OutboxStatus::Sent).unwrap() < 20 {
        assert!(Instant::now() < deadline, "rows not delivered in time");
        thread::sleep(Duration::from_millis(5));
    }

    let stats = worker.stop();
    assert_eq!(stats.sent, 20);
    assert_eq!(stats.dead_lettered, 0);
    assert_eq!(relay.len(), 20);
}

//! Polling, retry, dead-lettering and channel relays.

use std::sync::Arc;

use chrono::Duration;
use motionit_outbox::challenge::{YoutubeVideoPayload, ROOMS_TOPIC};
use motionit_outbox::channel::OUTBOX_ID_HEADER;
use motionit_outbox::{
    ChannelRelay, Clock, HandlerRegistry, InMemoryChannel, InMemoryStore, NewOutboxEvent,
    OutboxDispatcher, OutboxEvent, OutboxStatus, OutboxStore,
};

use crate::support::channel::{Failure, FlakyChannel};
use crate::support::models::ChallengeVideo;
use crate::support::service::StubMetadata;
use crate::support::App;

const RELAY_TOPIC: &str = "/topic/challenge/relay";
const ROOM_CHANGED: &str = "ROOM_CHANGED";

fn row_for(store: &InMemoryStore, youtube_url: &str) -> OutboxEvent {
    store
        .outbox_events()
        .unwrap()
        .into_iter()
        .find(|row| {
            row.decode::<YoutubeVideoPayload>()
                .is_ok_and(|payload| payload.youtube_url == youtube_url)
        })
        .expect("outbox row")
}

/// `count` relay rows committed in one transaction.
fn enqueue_relay_rows(app: &App, count: u64) {
    let mut tx = app.manager.begin();
    for room_id in 1..=count {
        tx.enqueue(NewOutboxEvent::new(
            ROOM_CHANGED,
            "ChallengeRoom",
            room_id,
            format!(r#"{{"roomId":{room_id}}}"#),
        ));
    }
    tx.commit().unwrap();
}

fn relay_dispatcher<C>(app: &App, channel: C) -> OutboxDispatcher<InMemoryStore>
where
    C: motionit_outbox::PubSubChannel + 'static,
{
    OutboxDispatcher::new(
        app.store().clone(),
        HandlerRegistry::new().with(ROOM_CHANGED, ChannelRelay::new(RELAY_TOPIC, channel)),
    )
    .with_clock(app.clock.clone())
}

#[test]
fn requested_upload_is_saved_and_broadcast_by_the_dispatcher() {
    let app = App::new();
    let room_id = app.room_with(2, &[5]);
    app.service
        .request_video_upload(5, room_id, "https://youtu.be/abc")
        .unwrap();
    app.channel.clear();

    let metadata = Arc::new(StubMetadata::new());
    let dispatcher = app.video_dispatcher(metadata.clone());
    let report = dispatcher.poll_and_dispatch().unwrap();
    assert_eq!(report.loaded, 1);
    assert_eq!(report.sent, 1);

    let videos = app.store().all::<ChallengeVideo>().unwrap();
    assert_eq!(videos.len(), 1);
    assert_eq!(videos[0].title, "video at https://youtu.be/abc");
    assert_eq!(app.channel.on_topic(ROOMS_TOPIC).len(), 1);

    let row = row_for(app.store(), "https://youtu.be/abc");
    assert_eq!(row.status, OutboxStatus::Sent);
    assert_eq!(row.attempt_count, 1);
    assert_eq!(row.last_error, None);

    assert!(dispatcher.poll_and_dispatch().unwrap().is_idle());
    assert_eq!(metadata.calls(), 1);
}

#[test]
fn one_poll_delivers_at_most_one_hundred_rows_in_id_order() {
    let app = App::new();
    enqueue_relay_rows(&app, 150);
    let relay = InMemoryChannel::new();
    let dispatcher = relay_dispatcher(&app, relay.clone());

    let first = dispatcher.poll_and_dispatch().unwrap();
    assert_eq!((first.loaded, first.sent), (100, 100));
    assert_eq!(app.store().count_by_status(OutboxStatus::Pending).unwrap(), 50);

    let ids: Vec<u64> = relay
        .on_topic(RELAY_TOPIC)
        .iter()
        .map(|m| m.header(OUTBOX_ID_HEADER).unwrap().parse().unwrap())
        .collect();
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));

    let second = dispatcher.poll_and_dispatch().unwrap();
    assert_eq!((second.loaded, second.sent), (50, 50));
    assert_eq!(app.store().count_by_status(OutboxStatus::Sent).unwrap(), 150);
    assert!(dispatcher.poll_and_dispatch().unwrap().is_idle());
}

#[test]
fn a_failing_row_does_not_stop_the_rest_of_the_batch() {
    let app = App::new();
    let room_id = app.room_with(3, &[1, 2, 3]);
    for (user, url) in [(1, "https://youtu.be/a"), (2, "https://youtu.be/b"), (3, "https://youtu.be/c")] {
        app.service.request_video_upload(user, room_id, url).unwrap();
    }

    let metadata = Arc::new(StubMetadata::new().fail_for("https://youtu.be/b"));
    let dispatcher = app.video_dispatcher(metadata.clone());
    let report = dispatcher.poll_and_dispatch().unwrap();
    assert_eq!((report.sent, report.retried), (2, 1));
    assert_eq!(app.store().all::<ChallengeVideo>().unwrap().len(), 2);

    let failed = row_for(app.store(), "https://youtu.be/b");
    assert_eq!(failed.status, OutboxStatus::Pending);
    assert_eq!(failed.attempt_count, 1);
    assert!(failed
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("metadata lookup failed")));
    assert_eq!(failed.next_attempt_at, Some(app.clock.now() + Duration::seconds(1)));

    // Not due until the backoff gate passes.
    assert!(dispatcher.poll_and_dispatch().unwrap().is_idle());
    metadata.recover("https://youtu.be/b");
    app.clock.advance(Duration::seconds(1));
    assert_eq!(dispatcher.poll_and_dispatch().unwrap().sent, 1);
    assert_eq!(app.store().all::<ChallengeVideo>().unwrap().len(), 3);
    assert_eq!(metadata.calls(), 4);
}

#[test]
fn fifth_failed_attempt_dead_letters_the_row() {
    let app = App::new();
    let room_id = app.room_with(1, &[9]);
    app.service
        .request_video_upload(9, room_id, "https://youtu.be/down")
        .unwrap();
    let metadata = Arc::new(StubMetadata::new().fail_for("https://youtu.be/down"));
    let dispatcher = app.video_dispatcher(metadata.clone());

    for attempt in 1..=4 {
        assert_eq!(dispatcher.poll_and_dispatch().unwrap().retried, 1);
        let row = row_for(app.store(), "https://youtu.be/down");
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.attempt_count, attempt);
        app.clock.advance(Duration::minutes(10));
    }

    assert_eq!(dispatcher.poll_and_dispatch().unwrap().dead_lettered, 1);
    let row = row_for(app.store(), "https://youtu.be/down");
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.attempt_count, 5);
    assert!(row.last_error.is_some());

    app.clock.advance(Duration::hours(1));
    assert!(dispatcher.poll_and_dispatch().unwrap().is_idle());
    assert_eq!(metadata.calls(), 5);

    // An operator requeues it once the lookup works again.
    metadata.recover("https://youtu.be/down");
    app.store().requeue_failed(row.id, app.clock.now()).unwrap();
    assert_eq!(dispatcher.poll_and_dispatch().unwrap().sent, 1);
    assert_eq!(app.store().all::<ChallengeVideo>().unwrap().len(), 1);
}

#[test]
fn unavailable_channel_defers_without_using_up_attempts() {
    let app = App::new();
    enqueue_relay_rows(&app, 1);
    let relay = InMemoryChannel::new();
    let flaky = Arc::new(FlakyChannel::new(relay.clone(), 7, Failure::Unavailable));
    let dispatcher = relay_dispatcher(&app, flaky.clone());

    for _ in 0..7 {
        assert_eq!(dispatcher.poll_and_dispatch().unwrap().deferred, 1);
        let row = &app.store().outbox_events().unwrap()[0];
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.attempt_count, 0);
        app.clock.advance(Duration::seconds(1));
    }

    assert_eq!(dispatcher.poll_and_dispatch().unwrap().sent, 1);
    let row = &app.store().outbox_events().unwrap()[0];
    assert_eq!(row.status, OutboxStatus::Sent);
    assert_eq!(row.attempt_count, 1);
    assert_eq!(flaky.attempts(), 8);
    assert_eq!(relay.len(), 1);
}

#[test]
fn transient_failures_end_in_exactly_one_delivery() {
    let app = App::new();
    enqueue_relay_rows(&app, 1);
    let relay = InMemoryChannel::new();
    let flaky = Arc::new(FlakyChannel::new(relay.clone(), 3, Failure::Transient));
    let dispatcher = relay_dispatcher(&app, flaky.clone());

    let mut polls = 0;
    while app.store().count_by_status(OutboxStatus::Sent).unwrap() == 0 {
        polls += 1;
        assert!(polls <= 10, "row never delivered");
        dispatcher.poll_and_dispatch().unwrap();
        app.clock.advance(Duration::minutes(10));
    }

    assert_eq!(relay.len(), 1);
    assert_eq!(flaky.attempts(), 4);
    let row = &app.store().outbox_events().unwrap()[0];
    assert_eq!(row.attempt_count, 4);
    assert_eq!(relay.messages()[0].header(OUTBOX_ID_HEADER), Some(row.id.to_string().as_str()));
}

#[test]
fn rows_without_a_handler_are_dead_lettered_at_once() {
    let app = App::new();
    let mut tx = app.manager.begin();
    tx.enqueue(NewOutboxEvent::new("UNKNOWN", "ChallengeRoom", 1, "{}"));
    tx.commit().unwrap();

    let dispatcher = app.video_dispatcher(Arc::new(StubMetadata::new()));
    assert_eq!(dispatcher.poll_and_dispatch().unwrap().dead_lettered, 1);
    let row = &app.store().outbox_events().unwrap()[0];
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.attempt_count, 1);
}

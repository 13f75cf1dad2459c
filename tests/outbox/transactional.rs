//! Domain writes, outbox rows and room broadcasts share one transaction.

use motionit_outbox::business::{ChallengeParticipantErrorCode, ChallengeVideoErrorCode};
use motionit_outbox::challenge::{RoomEvent, RoomEventKind, ROOMS_TOPIC, YOUTUBE_VIDEO};
use motionit_outbox::{Clock, DeliveryError, Error, OutboxStatus};

use crate::support::models::{ChallengeRoom, Participant};
use crate::support::App;

fn business_code(err: Error) -> &'static str {
    err.as_business().expect("business error").code()
}

#[test]
fn joining_a_room_broadcasts_one_room_event_after_commit() {
    let app = App::new();
    let room_id = app.room_with(3, &[]);
    let rooms = app.channel.subscribe(ROOMS_TOPIC);
    rooms.drain();

    let participant = app.service.join_room(room_id, 42).unwrap();

    let messages = rooms.drain();
    assert_eq!(messages.len(), 1);
    let event: RoomEvent = messages[0].decode().unwrap();
    assert_eq!(event.event, RoomEventKind::Room);
    assert_eq!(event.room_id, Some(room_id));

    let stored: Participant = app.store().find(participant.id.unwrap()).unwrap().unwrap();
    assert_eq!(stored.user_id, 42);
    let room: ChallengeRoom = app.store().find(room_id).unwrap().unwrap();
    assert_eq!(room.joined, 1);
}

#[test]
fn full_room_is_rejected_and_nothing_is_broadcast() {
    let app = App::new();
    let room_id = app.room_with(1, &[1]);
    app.channel.clear();

    let err = app.service.join_room(room_id, 2).unwrap_err();

    assert_eq!(business_code(err), "R-503");
    assert!(app.channel.is_empty());
    assert_eq!(app.store().all::<Participant>().unwrap().len(), 1);
    let room: ChallengeRoom = app.store().find(room_id).unwrap().unwrap();
    assert_eq!(room.joined, 1);
}

#[test]
fn joining_twice_is_rejected() {
    let app = App::new();
    let room_id = app.room_with(5, &[7]);

    let err = app.service.join_room(room_id, 7).unwrap_err();
    assert!(err
        .as_business()
        .is_some_and(|e| e.is(ChallengeParticipantErrorCode::AlreadyJoined)));
}

#[test]
fn unknown_room_is_a_business_error() {
    let app = App::new();
    let err = app.service.join_room(999, 1).unwrap_err();
    assert_eq!(business_code(err), "R-501");
}

#[test]
fn failing_broadcaster_does_not_undo_the_join() {
    let app = App::new();
    app.manager
        .registry()
        .add_broadcaster::<RoomEvent, _>("broken", |_: &RoomEvent| -> Result<(), DeliveryError> {
            Err(DeliveryError::transient("socket closed"))
        });
    let room_id = app.room_with(2, &[]);
    app.channel.clear();

    app.service.join_room(room_id, 1).unwrap();

    assert_eq!(app.store().all::<Participant>().unwrap().len(), 1);
    assert_eq!(app.channel.on_topic(ROOMS_TOPIC).len(), 1);
}

#[test]
fn upload_request_writes_an_outbox_row_in_the_same_transaction() {
    let app = App::new();
    let room_id = app.room_with(2, &[5]);

    app.service
        .request_video_upload(5, room_id, " https://youtu.be/abc ")
        .unwrap();

    let rows = app.store().outbox_events().unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.event_type, YOUTUBE_VIDEO);
    assert_eq!(row.aggregate_id, room_id);
    assert_eq!(row.status, OutboxStatus::Pending);
    assert_eq!(row.attempt_count, 0);
    assert_eq!(row.audit.created_at, Some(app.clock.now()));
}

#[test]
fn rejected_upload_request_leaves_no_outbox_row() {
    let app = App::new();
    let room_id = app.room_with(2, &[5]);

    let err = app
        .service
        .request_video_upload(6, room_id, "https://youtu.be/abc")
        .unwrap_err();
    assert!(err
        .as_business()
        .is_some_and(|e| e.is(ChallengeVideoErrorCode::UserNotParticipantInRoom)));

    let err = app
        .service
        .request_video_upload(5, room_id, "https://vimeo.com/1")
        .unwrap_err();
    assert_eq!(business_code(err), "R-602");

    assert!(app.store().outbox_events().unwrap().is_empty());
}

//! Challenge-room events and outbox types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::PubSubChannel;
use crate::listener::{ListenerRegistry, TopicBroadcaster};
use crate::outbox::NewOutboxEvent;

/// Topic browsers subscribe to for room list changes.
pub const ROOMS_TOPIC: &str = "/topic/challenge/rooms";

/// Outbox event type of a requested video upload.
pub const YOUTUBE_VIDEO: &str = "YOUTUBE_VIDEO";

pub const CHALLENGE_VIDEO_AGGREGATE: &str = "ChallengeVideo";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomEventKind {
    /// Something about a room changed; clients refetch the room list.
    Room,
}

/// A change to a challenge room, broadcast after the change commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomEvent {
    pub event: RoomEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<u64>,
    pub occurred_at: DateTime<Utc>,
}

impl RoomEvent {
    pub fn room(room_id: u64, occurred_at: DateTime<Utc>) -> Self {
        RoomEvent {
            event: RoomEventKind::Room,
            room_id: Some(room_id),
            occurred_at,
        }
    }
}

/// Broadcaster sending [`RoomEvent`]s to [`ROOMS_TOPIC`].
pub fn room_broadcaster<C: PubSubChannel>(channel: C) -> TopicBroadcaster<RoomEvent, C> {
    TopicBroadcaster::new(ROOMS_TOPIC, channel)
}

/// Broadcast every committed [`RoomEvent`] on `channel`.
pub fn register_room_broadcaster<C>(registry: &ListenerRegistry, channel: C)
where
    C: PubSubChannel + 'static,
{
    registry.add_broadcaster::<RoomEvent, _>("room-broadcaster", room_broadcaster(channel));
}

/// Payload of a [`YOUTUBE_VIDEO`] outbox event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YoutubeVideoPayload {
    pub user_id: u64,
    pub room_id: u64,
    pub youtube_url: String,
}

impl YoutubeVideoPayload {
    pub fn new(user_id: u64, room_id: u64, youtube_url: &str) -> Self {
        YoutubeVideoPayload {
            user_id,
            room_id,
            youtube_url: youtube_url.trim().to_string(),
        }
    }

    /// The outbox row for this upload, keyed by room.
    pub fn to_outbox_event(&self) -> Result<NewOutboxEvent, serde_json::Error> {
        NewOutboxEvent::json(YOUTUBE_VIDEO, CHALLENGE_VIDEO_AGGREGATE, self.room_id, self)
    }
}

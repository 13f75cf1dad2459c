//! Services the way an application would write them on top of the crate.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use motionit_outbox::business::{ChallengeParticipantErrorCode, ChallengeVideoErrorCode};
use motionit_outbox::challenge::{RoomEvent, YoutubeVideoPayload};
use motionit_outbox::{
    BusinessError, DeliveryError, Error, EventPublisher, InMemoryStore, OutboxEvent,
    OutboxHandler, Result, TransactionManager,
};

use super::models::{ChallengeRoom, ChallengeVideo, Participant};

const YOUTUBE_PREFIXES: [&str; 2] = ["https://www.youtube.com/watch?v=", "https://youtu.be/"];

pub struct ChallengeService {
    manager: Arc<TransactionManager<InMemoryStore>>,
}

impl ChallengeService {
    pub fn new(manager: Arc<TransactionManager<InMemoryStore>>) -> Self {
        ChallengeService { manager }
    }

    pub fn store(&self) -> &InMemoryStore {
        self.manager.store()
    }

    pub fn create_room(&self, title: &str, capacity: u32) -> Result<ChallengeRoom> {
        self.manager.in_transaction(|tx| -> Result<_, Error> {
            let room = tx.insert(ChallengeRoom::new(title, capacity))?;
            let now = tx.now();
            if let Some(id) = room.id {
                tx.publish(RoomEvent::room(id, now));
            }
            Ok(room)
        })
    }

    pub fn join_room(&self, room_id: u64, user_id: u64) -> Result<Participant> {
        self.manager.in_transaction(|tx| -> Result<_, Error> {
            let mut room = tx.get::<ChallengeRoom>(room_id)?.ok_or_else(|| {
                BusinessError::new(ChallengeParticipantErrorCode::CannotFindChallengeRoom)
            })?;
            if self.is_participant(room_id, user_id)? {
                return Err(BusinessError::new(ChallengeParticipantErrorCode::AlreadyJoined).into());
            }
            if room.is_full() {
                return Err(BusinessError::with_detail(
                    ChallengeParticipantErrorCode::FullJoinedRoom,
                    format!("room {room_id} holds {} users", room.capacity),
                )
                .into());
            }

            let participant = tx.insert(Participant {
                id: None,
                room_id,
                user_id,
                audit: Default::default(),
            })?;
            room.joined += 1;
            tx.update(room)?;

            let now = tx.now();
            tx.publish(RoomEvent::room(room_id, now));
            Ok(participant)
        })
    }

    /// Record the upload request. The video itself is saved later, when the
    /// dispatcher delivers the outbox row to [`VideoUploadHandler`].
    pub fn request_video_upload(&self, user_id: u64, room_id: u64, youtube_url: &str) -> Result<()> {
        let youtube_url = youtube_url.trim();
        if !YOUTUBE_PREFIXES.iter().any(|prefix| youtube_url.starts_with(prefix)) {
            return Err(BusinessError::new(ChallengeVideoErrorCode::InvalidVideoFormat).into());
        }

        self.manager.in_transaction(|tx| -> Result<_, Error> {
            if tx.get::<ChallengeRoom>(room_id)?.is_none() {
                return Err(
                    BusinessError::new(ChallengeVideoErrorCode::CannotFindChallengeRoom).into(),
                );
            }
            if !self.is_participant(room_id, user_id)? {
                return Err(
                    BusinessError::new(ChallengeVideoErrorCode::UserNotParticipantInRoom).into(),
                );
            }
            tx.enqueue(YoutubeVideoPayload::new(user_id, room_id, youtube_url).to_outbox_event()?);
            Ok(())
        })
    }

    fn is_participant(&self, room_id: u64, user_id: u64) -> Result<bool> {
        Ok(self
            .store()
            .all::<Participant>()?
            .iter()
            .any(|p| p.room_id == room_id && p.user_id == user_id))
    }
}

pub trait VideoMetadataClient: Send + Sync {
    fn fetch_title(&self, youtube_url: &str) -> Result<String, DeliveryError>;
}

/// Metadata lookups that succeed unless told to fail for a URL.
#[derive(Default)]
pub struct StubMetadata {
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl StubMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(self, youtube_url: &str) -> Self {
        self.failing
            .lock()
            .unwrap()
            .insert(youtube_url.to_string());
        self
    }

    pub fn recover(&self, youtube_url: &str) {
        self.failing.lock().unwrap().remove(youtube_url);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl VideoMetadataClient for StubMetadata {
    fn fetch_title(&self, youtube_url: &str) -> Result<String, DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(youtube_url) {
            return Err(DeliveryError::transient(format!(
                "metadata lookup failed for {youtube_url}"
            )));
        }
        Ok(format!("video at {youtube_url}"))
    }
}

/// Handles `YOUTUBE_VIDEO` rows: looks up metadata, saves the video and
/// announces the room change.
pub struct VideoUploadHandler<M> {
    manager: Arc<TransactionManager<InMemoryStore>>,
    metadata: Arc<M>,
}

impl<M: VideoMetadataClient> VideoUploadHandler<M> {
    pub fn new(manager: Arc<TransactionManager<InMemoryStore>>, metadata: Arc<M>) -> Self {
        VideoUploadHandler { manager, metadata }
    }

    fn save(&self, payload: &YoutubeVideoPayload, title: String) -> Result<()> {
        self.manager.in_transaction(|tx| -> Result<_, Error> {
            let duplicate = self.manager.store().all::<ChallengeVideo>()?.iter().any(|v| {
                v.room_id == payload.room_id && v.youtube_url == payload.youtube_url
            });
            if duplicate {
                return Ok(());
            }
            tx.insert(ChallengeVideo {
                id: None,
                room_id: payload.room_id,
                user_id: payload.user_id,
                youtube_url: payload.youtube_url.clone(),
                title,
                audit: Default::default(),
            })?;
            let now = tx.now();
            tx.publish(RoomEvent::room(payload.room_id, now));
            Ok(())
        })
    }
}

impl<M: VideoMetadataClient> OutboxHandler for VideoUploadHandler<M> {
    fn handle(&self, event: &OutboxEvent) -> Result<(), DeliveryError> {
        let payload: YoutubeVideoPayload = event.decode()?;
        let title = self.metadata.fetch_title(&payload.youtube_url)?;
        self.save(&payload, title).map_err(DeliveryError::transient)
    }
}

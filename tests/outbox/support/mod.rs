//! Test domain: challenge rooms, participants and uploaded videos.

pub mod channel;
pub mod service;

use std::sync::Arc;

use motionit_outbox::challenge::{register_room_broadcaster, YOUTUBE_VIDEO};
use motionit_outbox::{
    HandlerRegistry, InMemoryChannel, InMemoryStore, ListenerRegistry, ManualClock,
    OutboxDispatcher, RetryPolicy, TransactionManager,
};

use service::{ChallengeService, StubMetadata, VideoUploadHandler};

/// The wiring an application would do at startup, over an in-memory store,
/// an in-memory channel and a manual clock.
pub struct App {
    pub clock: ManualClock,
    pub manager: Arc<TransactionManager<InMemoryStore>>,
    pub service: ChallengeService,
    pub channel: InMemoryChannel,
}

impl App {
    pub fn new() -> Self {
        let clock = ManualClock::default();
        let manager = Arc::new(
            TransactionManager::new(InMemoryStore::new(), Arc::new(ListenerRegistry::new()))
                .with_clock(clock.clone()),
        );
        let channel = InMemoryChannel::new();
        register_room_broadcaster(manager.registry(), channel.clone());
        App {
            clock,
            service: ChallengeService::new(manager.clone()),
            manager,
            channel,
        }
    }

    pub fn store(&self) -> &InMemoryStore {
        self.manager.store()
    }

    /// A room with `users` already joined.
    pub fn room_with(&self, capacity: u32, users: &[u64]) -> u64 {
        let room = self.service.create_room("10k steps", capacity).unwrap();
        let room_id = room.id.unwrap();
        for user in users {
            self.service.join_room(room_id, *user).unwrap();
        }
        room_id
    }

    /// A dispatcher handling `YOUTUBE_VIDEO` rows, sharing the app's store
    /// and clock.
    pub fn video_dispatcher(&self, metadata: Arc<StubMetadata>) -> OutboxDispatcher<InMemoryStore> {
        let handlers = HandlerRegistry::new().with(
            YOUTUBE_VIDEO,
            VideoUploadHandler::new(self.manager.clone(), metadata),
        );
        OutboxDispatcher::new(self.store().clone(), handlers)
            .with_clock(self.clock.clone())
            .with_retry_policy(RetryPolicy::default())
    }
}

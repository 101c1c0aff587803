//! Room set management: one controller per watched room, reference-counted
//! by named subscribers so collaborator layers can share rooms without
//! tearing each other's recordings down.

pub mod controller;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::api::LiveApi;
use crate::config::{MonitorConfig, UploadConfig};
use crate::events::{RoomEvent, RoomEventKind};
use crate::meta::MetaStore;
use crate::recorder::RecorderSettings;
use crate::upload::ChunkUploader;

use controller::RecordingController;

/// Shared dependencies handed to every room pipeline.
pub struct AgentContext {
    pub api: Arc<dyn LiveApi>,
    pub store: MetaStore,
    pub uploader: Arc<ChunkUploader>,
    pub settings: RecorderSettings,
    pub monitor: MonitorConfig,
    pub upload: UploadConfig,
    pub events: broadcast::Sender<RoomEvent>,
}

/// Owns the controllers. A room exists while at least one subscriber wants
/// it; adding and removing subscribers at runtime hot-reloads the set.
pub struct RoomSetManager {
    ctx: Arc<AgentContext>,
    rooms: HashMap<u64, RecordingController>,
    subscribers: HashMap<u64, HashSet<String>>,
}

impl RoomSetManager {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self {
            ctx,
            rooms: HashMap::new(),
            subscribers: HashMap::new(),
        }
    }

    pub fn room_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.rooms.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn has_subscriber(&self, room_id: u64, subscriber: &str) -> bool {
        self.subscribers
            .get(&room_id)
            .map(|subs| subs.contains(subscriber))
            .unwrap_or(false)
    }

    /// Register interest in a room. Idempotent per subscriber name; the
    /// first subscriber spins the controller up.
    pub fn add_subscriber(&mut self, room_id: u64, subscriber: &str) {
        let subs = self.subscribers.entry(room_id).or_default();
        if !subs.insert(subscriber.to_string()) {
            return;
        }

        if !self.rooms.contains_key(&room_id) {
            info!(room_id, subscriber, "room added");
            let controller = RecordingController::spawn(room_id, Arc::clone(&self.ctx));
            self.rooms.insert(room_id, controller);
            let _ = self.ctx.events.send(RoomEvent {
                room_id,
                kind: RoomEventKind::HotReloadAdd,
            });
        }
    }

    /// Withdraw one subscriber. The last one out destroys the controller.
    pub async fn reduce_subscriber(&mut self, room_id: u64, subscriber: &str) {
        let Some(subs) = self.subscribers.get_mut(&room_id) else {
            return;
        };
        subs.remove(subscriber);
        if !subs.is_empty() {
            return;
        }

        self.subscribers.remove(&room_id);
        if let Some(controller) = self.rooms.remove(&room_id) {
            info!(room_id, subscriber, "last subscriber left, removing room");
            controller.destroy().await;
            let _ = self.ctx.events.send(RoomEvent {
                room_id,
                kind: RoomEventKind::HotReloadRemove,
            });
        }
    }

    /// Stop a room's current recording without removing the room.
    pub async fn stop_room(&self, room_id: u64) {
        if let Some(controller) = self.rooms.get(&room_id) {
            controller.stop_recording().await;
        }
    }

    /// Destroy every controller. In-flight sessions are left on disk for
    /// the next startup's recovery pass.
    pub async fn shutdown(mut self) {
        for (_, controller) in self.rooms.drain() {
            controller.destroy().await;
        }
        self.subscribers.clear();
    }
}

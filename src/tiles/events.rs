//! `tileload` / `tileerror` notifications

use super::{key::TileKey, loader::LoadError};
use crate::prelude::HashMap;
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum TileEvent {
    /// A first load committed to the cache
    #[serde(rename = "tileload")]
    Load { key: TileKey, url: String },
    /// A load failed with a transport error
    #[serde(rename = "tileerror")]
    Error {
        key: TileKey,
        url: String,
        #[serde(serialize_with = "error_as_string")]
        error: LoadError,
    },
}

fn error_as_string<S: serde::Serializer>(error: &LoadError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

impl TileEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            TileEvent::Load { .. } => "tileload",
            TileEvent::Error { .. } => "tileerror",
        }
    }

    pub fn key(&self) -> TileKey {
        match self {
            TileEvent::Load { key, .. } | TileEvent::Error { key, .. } => *key,
        }
    }
}

/// Event listener callback type
pub type TileEventCallback = Box<dyn Fn(&TileEvent) + Send + Sync>;

/// Queues tile events on the completion path and hands them to listeners once
/// the layer is done mutating its state.
#[derive(Default)]
pub struct TileEventManager {
    /// Listeners by event type
    listeners: HashMap<&'static str, Vec<TileEventCallback>>,
    /// Listeners for every event
    catch_all: Vec<TileEventCallback>,
    event_queue: VecDeque<TileEvent>,
}

impl TileEventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `"tileload"` or `"tileerror"`
    pub fn on<F>(&mut self, event_type: &str, callback: F)
    where
        F: Fn(&TileEvent) + Send + Sync + 'static,
    {
        let event_type = match event_type {
            "tileload" => "tileload",
            "tileerror" => "tileerror",
            other => {
                log::warn!("ignoring listener for unknown tile event {:?}", other);
                return;
            }
        };
        self.listeners
            .entry(event_type)
            .or_default()
            .push(Box::new(callback));
    }

    /// Register a listener for every tile event
    pub fn subscribe<F>(&mut self, callback: F)
    where
        F: Fn(&TileEvent) + Send + Sync + 'static,
    {
        self.catch_all.push(Box::new(callback));
    }

    pub fn emit(&mut self, event: TileEvent) {
        self.event_queue.push_back(event);
    }

    /// Deliver all queued events, returning them
    pub fn process_events(&mut self) -> Vec<TileEvent> {
        let events: Vec<_> = self.event_queue.drain(..).collect();

        for event in &events {
            if let Some(callbacks) = self.listeners.get(event.event_type()) {
                for callback in callbacks {
                    callback(event);
                }
            }
            for callback in &self.catch_all {
                callback(event);
            }
        }

        events
    }

    pub fn pending_events(&self) -> usize {
        self.event_queue.len()
    }
}

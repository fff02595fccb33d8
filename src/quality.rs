//! Connection quality monitor
//! Folds the transport's quality samples into Unknown/Good/Bad and reports changes only

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::events::{EventBus, Subscription};
use crate::room::{MediaRoom, RawQuality, RoomEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionQuality {
    #[default]
    Unknown,
    Good,
    Bad,
}

impl From<RawQuality> for ConnectionQuality {
    fn from(raw: RawQuality) -> Self {
        match raw {
            RawQuality::Excellent | RawQuality::Good => ConnectionQuality::Good,
            RawQuality::Poor | RawQuality::Lost => ConnectionQuality::Bad,
            RawQuality::Unknown => ConnectionQuality::Unknown,
        }
    }
}

pub struct ConnectionQualityMonitor {
    current: Mutex<ConnectionQuality>,
    subscription: Mutex<Option<Subscription>>,
    events: EventBus<ConnectionQuality>,
}

impl ConnectionQualityMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(ConnectionQuality::Unknown),
            subscription: Mutex::new(None),
            events: EventBus::new(),
        })
    }

    pub fn quality(&self) -> ConnectionQuality {
        *self.current.lock()
    }

    pub fn events(&self) -> &EventBus<ConnectionQuality> {
        &self.events
    }

    pub fn is_running(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Start following the room's quality samples. Restarting replaces the old listener.
    pub fn start(self: &Arc<Self>, room: &dyn MediaRoom) {
        let weak = Arc::downgrade(self);
        let subscription = room.events().subscribe(move |event| {
            if let RoomEvent::ConnectionQualityChanged(raw) = event {
                if let Some(monitor) = weak.upgrade() {
                    monitor.record(*raw);
                }
            }
        });
        *self.subscription.lock() = Some(subscription);
    }

    /// Stop listening. The level falls back to Unknown without an event.
    pub fn stop(&self) {
        self.subscription.lock().take();
        *self.current.lock() = ConnectionQuality::Unknown;
    }

    /// Feed one transport sample
    pub fn record(&self, raw: RawQuality) {
        let quality = ConnectionQuality::from(raw);
        {
            let mut current = self.current.lock();
            if *current == quality {
                return;
            }
            *current = quality;
        }
        tracing::debug!("Connection quality: {:?}", quality);
        self.events.emit(&quality);
    }
}

use std::sync::Arc;

use crate::dispatch::SubscriberHub;
use crate::models::event::EventStore;
use crate::models::session::SessionStore;
use crate::timer::{TimerRegistry, TimerSettings};

/// Everything the handlers, timer drivers and dispatcher share. Built once in
/// `main`; tests assemble one over in-memory stores.
pub struct AppState {
    pub sessions: Arc<dyn SessionStore>,
    pub events: Arc<dyn EventStore>,
    pub hub: SubscriberHub,
    pub timers: TimerRegistry,
    pub timer_settings: TimerSettings,
}

pub type SharedState = Arc<AppState>;

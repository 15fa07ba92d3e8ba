//! Wiring of the core services and their outside collaborators.

pub mod provider;

use std::sync::Arc;

use domain::services::{
    BroadcastDispatcher, BroadcastScheduler, Clock, ContactResolver, DeviceDirectory,
    DeviceSessionManager, DirectSender, EventBus, MessagingProvider, Notifier, PlanRepository,
    QuotaEnforcer,
};
use domain::store::{BroadcastStore, DeviceStore, QuotaStore};

use crate::config::{Config, ConfigValidationError};

pub use provider::HttpMessagingProvider;

/// Everything the core needs from the outside world.
pub struct Collaborators {
    pub devices: Arc<dyn DeviceStore>,
    pub broadcasts: Arc<dyn BroadcastStore>,
    pub quotas: Arc<dyn QuotaStore>,
    pub contacts: Arc<dyn ContactResolver>,
    pub plans: Arc<dyn PlanRepository>,
    pub provider: Arc<dyn MessagingProvider>,
    pub clock: Arc<dyn Clock>,
}

/// The core services shared by handlers and jobs. Cheap to clone.
#[derive(Clone)]
pub struct CoreServices {
    pub sessions: DeviceSessionManager,
    pub devices: DeviceDirectory,
    pub messages: DirectSender,
    pub quota: QuotaEnforcer,
    pub broadcasts: BroadcastScheduler,
    pub events: EventBus,
}

impl CoreServices {
    pub fn build(collab: Collaborators, config: &Config) -> Result<Self, ConfigValidationError> {
        let events = EventBus::new(config.events.channel_capacity);
        let notifier: Arc<dyn Notifier> = Arc::new(events.clone());

        let sessions = DeviceSessionManager::new(
            collab.devices.clone(),
            collab.provider,
            notifier.clone(),
            collab.clock.clone(),
            config.sessions.settings(),
        );
        let quota = QuotaEnforcer::new(
            collab.quotas,
            collab.plans,
            collab.clock.clone(),
            config.quota.settings()?,
        );
        let dispatcher = BroadcastDispatcher::new(
            collab.broadcasts.clone(),
            sessions.clone(),
            collab.contacts.clone(),
            quota.clone(),
            notifier,
            collab.clock.clone(),
            config.broadcasts.settings(),
        );
        let broadcasts = BroadcastScheduler::new(
            collab.broadcasts,
            sessions.clone(),
            collab.contacts,
            dispatcher,
            collab.clock.clone(),
        );
        let devices = DeviceDirectory::new(
            collab.devices,
            sessions.clone(),
            broadcasts.clone(),
            quota.clone(),
            collab.clock,
        );

        let messages = DirectSender::new(sessions.clone(), quota.clone());

        Ok(Self {
            sessions,
            devices,
            messages,
            quota,
            broadcasts,
            events,
        })
    }
}

//! Core services of the session gateway.
//!
//! Services hold business logic over the domain models and reach the
//! outside world only through the collaborator traits defined here and the
//! repository traits in [`crate::store`].

pub mod broadcast_scheduler;
pub mod clock;
pub mod contacts;
pub mod devices;
pub mod direct_send;
pub mod dispatcher;
pub mod messaging;
pub mod notifier;
pub mod plans;
pub mod quota;
pub mod session;
pub mod session_manager;

pub use broadcast_scheduler::BroadcastScheduler;
pub use clock::{Clock, ManualClock, SystemClock};
pub use contacts::{normalize_unique, ContactResolver, StaticContactResolver};
pub use devices::DeviceDirectory;
pub use direct_send::DirectSender;
pub use dispatcher::{BroadcastDispatcher, DispatchSettings};
pub use messaging::{
    MessagingProvider, MockMessagingProvider, MockSendBehavior, PairingHandle, ProviderError,
    ProviderEvent, ProviderEventKind, SendReceipt, SentMessage,
};
pub use notifier::{EventBus, Notifier, RecordingNotifier, RoomSubscription};
pub use plans::{FixedPlanRepository, PlanRepository};
pub use quota::{QuotaEnforcer, QuotaPermit, QuotaSettings};
pub use session::{SessionInput, SessionState};
pub use session_manager::{DeviceSessionManager, SendError, SessionSettings};

//! Domain models for the session gateway.

pub mod broadcast;
pub mod device;
pub mod event;
pub mod quota;

pub use broadcast::{
    Broadcast, BroadcastProgress, BroadcastStatus, CreateBroadcastRequest, MessageKind,
    MessagePayload, RecipientOutcome, RecipientSpec, RecipientStatus, SendFailure,
    SendMessageRequest,
};
pub use device::{Device, DeviceStatus, DeviceStatusResponse, QrState};
pub use event::{GatewayEvent, GatewayEventKind, Room};
pub use quota::{PlanLimits, QuotaCheck, QuotaLimit, QuotaPeriod, ResourceKind};

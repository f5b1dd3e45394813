pub mod delivery;
pub mod encoder;
pub mod notify;
pub mod orchestrator;
pub mod request;
pub mod settings;

pub use encoder::{EncodeError, LinkEncoder};
pub use notify::{NotificationBoard, NotificationChannel, NotificationRecord};
pub use orchestrator::{DeliveryOrchestrator, DeliverySettings, DeliveryState, DeliveryTarget};
pub use request::{BoundedReply, BoundedRequest, RequestFailure};

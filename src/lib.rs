pub mod alerts;
pub mod config;
pub mod detect;
pub mod link;
pub mod message;

pub use alerts::{AlertManager, AlertSnapshot, Disposition, RetryOutcome};
pub use config::{AlertConfig, BridgeConfig, LinkConfig};
pub use detect::{Detection, Detector, Frame};
pub use link::{
    AckRecord, AckTracker, ChannelStatus, HistoryEntry, SerialLink, SerialPortLink,
    TransportChannel,
};
pub use message::{ConditionKind, EmergencyMessage, MessageIdGen};

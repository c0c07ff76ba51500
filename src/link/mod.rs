pub mod ack;
pub mod channel;
pub mod serial;

pub use ack::{AckRecord, AckTracker};
pub use channel::{ChannelStatus, HistoryEntry, TransportChannel};
pub use serial::{SerialLink, SerialPortLink};

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

/// Maximum message text length on the wire (the radio frame reserves 128
/// bytes for the text field, one of which is the terminator).
pub const MAX_TEXT_LEN: usize = 127;

/// Category of a detected hazard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionKind {
    Fire,
    Damage,
    Person,
}

impl ConditionKind {
    /// Wire code for this condition: 1 = fire, 2 = damage, 3 = other.
    pub fn emergency_code(&self) -> u8 {
        match self {
            ConditionKind::Fire => 1,
            ConditionKind::Damage => 2,
            ConditionKind::Person => 3,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConditionKind::Fire => "fire",
            ConditionKind::Damage => "damage",
            ConditionKind::Person => "person",
        }
    }
}

/// A single emergency report as transmitted over the radio link.
///
/// Field names are the wire contract; the ground receiver parses them
/// verbatim, so the serde renames must not change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmergencyMessage {
    pub text: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(rename = "emergencyCode")]
    pub emergency_code: u8,
    #[serde(rename = "messageId")]
    pub message_id: i64,
}

impl EmergencyMessage {
    pub fn new(text: impl Into<String>, kind: ConditionKind, message_id: i64) -> Self {
        let mut text: String = text.into();
        if text.chars().count() > MAX_TEXT_LEN {
            text = text.chars().take(MAX_TEXT_LEN).collect();
        }
        Self {
            text,
            latitude: 0.0,
            longitude: 0.0,
            emergency_code: kind.emergency_code(),
            message_id,
        }
    }

    pub fn with_position(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = latitude;
        self.longitude = longitude;
        self
    }

    /// Newline-terminated JSON frame ready for the serial link.
    pub fn wire_line(&self) -> anyhow::Result<String> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{}\n", json))
    }
}

/// Monotonic message-id source.
///
/// Ids are seeded from the epoch-millisecond clock and incremented per
/// message, so two messages minted in the same second never collide while
/// ids stay roughly time-ordered for the operator reading logs.
#[derive(Debug)]
pub struct MessageIdGen {
    next: AtomicI64,
}

impl MessageIdGen {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
        }
    }

    pub fn next_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MessageIdGen {
    fn default() -> Self {
        Self::new()
    }
}

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use utoipa::ToSchema;

/// Lifecycle position of an order.
///
/// Declaration order is the progression order: `progress` moves exactly one step
/// down this list and stops at `Delivered`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    ToSchema,
    EnumString,
    Display,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryStatus {
    New,
    Confirmed,
    DeliveryBooked,
    InTransit,
    Delivered,
}

/// The progression table.
pub const PROGRESSION: [DeliveryStatus; 5] = [
    DeliveryStatus::New,
    DeliveryStatus::Confirmed,
    DeliveryStatus::DeliveryBooked,
    DeliveryStatus::InTransit,
    DeliveryStatus::Delivered,
];

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Confirmed => "confirmed",
            Self::DeliveryBooked => "delivery_booked",
            Self::InTransit => "in_transit",
            Self::Delivered => "delivered",
        }
    }

    /// The status following this one, or `None` at the end of the table.
    pub fn next(self) -> Option<DeliveryStatus> {
        let position = PROGRESSION.iter().position(|s| *s == self)?;
        PROGRESSION.get(position + 1).copied()
    }

    pub fn is_final(self) -> bool {
        self.next().is_none()
    }

    /// Parses a stored status; blank means `New`, unrecognized means `None`.
    pub fn from_stored(raw: &str) -> Option<DeliveryStatus> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Some(DeliveryStatus::New);
        }
        trimmed.parse().ok()
    }

    /// Comma-separated list of every valid status, for error messages.
    pub fn valid_values() -> String {
        DeliveryStatus::iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// `next` over raw strings; anything outside the table has no next status.
pub fn next_status(status: &str) -> Option<DeliveryStatus> {
    DeliveryStatus::from_stored(status).and_then(DeliveryStatus::next)
}

//! A behavioral model of MMC and SD storage cards.
//!
//! The model speaks the card side of the MMC/SD command protocol in both
//! native and SPI framing, tracks the specified card state machine, and
//! backs its data phases with a pluggable storage backend. It never owns a
//! thread or blocks: the host controller drives it by submitting commands
//! and packets, and anything time-delayed is expressed through a
//! [`services::TimerService`] re-invocation.
//!
//! Construct a [`card::Card`] from one of the [`spec`] templates, register
//! a [`listener::CardListener`] to receive autonomously paced data-phase
//! bytes, and feed commands through [`card::Card::do_command`].

use std::fmt;
use std::io;

pub mod backing;
pub mod bits;
pub mod card;
pub mod crc;
pub mod listener;
pub mod response;
pub mod services;
pub mod spec;
pub mod state;
mod transfer;

pub use card::{Card, CardEvent};
pub use listener::CardListener;
pub use response::{Response, ResponseKind};
pub use state::{CardFamily, CardState, Transport};

/// Construction-time failures. Protocol-level faults are never surfaced
/// here; those are reported in-band through status bits, as real cards do.
#[derive(Debug)]
pub enum ModelError {
    /// No template with the requested product name.
    UnknownProduct(String),
    /// The backing-store size cannot be expressed in the template's CSD
    /// capacity fields.
    UnrepresentableCapacity { size: u64 },
    /// The CSD declares a structure version the model does not implement.
    UnsupportedCsdStructure(u8),
    /// The backing store has zero size.
    EmptyImage,
    /// A listener is already registered on this card.
    ListenerBusy,
    Io(io::Error),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnknownProduct(name) => {
                write!(f, "no card template named {name:?}")
            }
            ModelError::UnrepresentableCapacity { size } => {
                write!(f, "capacity {size} not representable in the CSD")
            }
            ModelError::UnsupportedCsdStructure(v) => {
                write!(f, "unsupported CSD structure version {v}")
            }
            ModelError::EmptyImage => write!(f, "backing image is empty"),
            ModelError::ListenerBusy => write!(f, "card already has a listener"),
            ModelError::Io(err) => write!(f, "image I/O error: {err}"),
        }
    }
}

impl std::error::Error for ModelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ModelError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ModelError {
    fn from(err: io::Error) -> ModelError {
        ModelError::Io(err)
    }
}

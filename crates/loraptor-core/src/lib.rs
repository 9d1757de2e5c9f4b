//! loraptor-core: wire format, envelope codec, message records and config.
//! All other LoRaptor crates depend on this one.

pub mod clock;
pub mod compress;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod message;
pub mod wire;

pub use clock::{Clock, ManualClock, SystemClock};
pub use envelope::{DecodeError, EncodeError, Envelope, PayloadType};
pub use message::{MessageHash, MessageRecord, PreparedPayload};
pub use wire::{NodeAddress, BROADCAST_ADDR};

//! # peer-types
//!
//! Wire format types for the hearth peer-to-peer social node.
//!
//! This crate provides the foundational types shared by every hearth crate:
//! - [`PeerId`], [`Sequence`], [`ContentHash`] - Identity and ordering types
//! - [`Endpoint`], [`AddressRecord`], [`WireAddress`] - Reachability types
//! - [`RegistryRecord`] - Signed address set published to registries
//! - [`Delta`] - One unit of synchronized content
//! - [`WireMessage`] - The closed set of peer-to-peer frames
//! - [`WireError`] - Error types
//! - [`api`] - JSON bodies of the registry HTTP API

#![warn(missing_docs)]
#![warn(clippy::all)]

mod address;
pub mod api;
mod delta;
pub mod encoding;
mod error;
mod ids;
mod messages;
mod record;

pub use address::{AddressRecord, AddressSource, Endpoint, Protocol, WireAddress};
pub use delta::Delta;
pub use error::WireError;
pub use ids::{ContentHash, PeerId, Sequence};
pub use messages::{Ack, Handshake, SyncMessage, WireMessage};
pub use record::{RegistryRecord, RECORD_SIGNING_DOMAIN};

//! Wire protocol for agent tunnels.
//!
//! Every exchange between the server and an agent is a single framed
//! message carried over the tunnel's TLS connection:
//!
//! ```text
//! ┌────────────┬────────────┬────────────┬────────────┬──────────────────────┐
//! │ u32 size   │ u16 code   │ u16 flags  │ u32 id     │ fields | raw payload │
//! └────────────┴────────────┴────────────┴────────────┴──────────────────────┘
//! ```
//!
//! All integers are big-endian and `size` covers the whole frame including
//! itself. A frame either carries a numbered field list (control messages)
//! or, when [`flags::RAW_BINARY`] is set, one opaque payload (channel data).
//!
//! # Modules
//!
//! - [`message`]: message codes, field ids, typed field values, result codes
//! - [`codec`]: [`FrameCodec`], a `tokio_util` codec with a bounded frame size

#![deny(missing_docs)]

pub mod codec;
pub mod message;

pub use codec::{FrameCodec, FrameError, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};
pub use message::{flags, rcc, FieldId, FieldType, FieldValue, Message, MessageCode};

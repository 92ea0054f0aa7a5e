//! lauberhorn-core: wire-level pieces of the Lauberhorn ECI protocol.
//!
//! The host and the FPGA exchange packets through cache-coherent memory,
//! one 128-byte cacheline at a time. This crate knows where those
//! cachelines live ([`RegionLayout`]), how the 64-byte control header is
//! laid out ([`ControlFormat`]), and how to turn a header into a
//! [`Transaction`] and back ([`ControlCodec`]).
//!
//! Nothing here touches memory or synchronizes; see
//! `lauberhorn-transport-eci` for the exchange engine.
//!
//! ```text
//!  0                      64                     128
//!  ├──────────────────────┼──────────────────────┤
//!  │ control header       │ inline payload       │  control cacheline
//!  │ valid|len|ty|fields  │ bytes [0, 64)        │
//!  └──────────────────────┴──────────────────────┘
//!  ├──────────────────────────────────────────────┤
//!  │ payload bytes [64 + 128 i, 64 + 128 (i + 1))  │  overflow cacheline i
//!  └──────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]

pub mod codec;
pub mod format;
pub mod layout;
mod transaction;

pub use codec::{inline_window, Cacheline, ControlCodec, ControlHeader, EncodeError};
pub use format::{BitField, ControlFormat, FormatError, TagCodes, DEFAULT_FORMAT};
pub use layout::{
    Direction, LayoutError, RegionLayout, CACHELINE_SIZE, CONTROL_HEADER_SIZE, DEFAULT_LAYOUT,
    INLINE_DATA_OFFSET, INLINE_DATA_SIZE,
};
pub use transaction::{
    Bypass, HeaderKind, InlineBytes, OncRpc, Transaction, TransactionKind, ETHERNET_HEADER_LEN,
    IP_HEADER_LEN, UDP_HEADER_LEN,
};

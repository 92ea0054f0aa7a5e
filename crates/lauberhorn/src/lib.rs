//! lauberhorn: host-side driver for the Lauberhorn FPGA NIC.
//!
//! The NIC and the CPU exchange packets and ONC-RPC calls through pairs of
//! 128-byte control cachelines in cache-coherent memory, with longer
//! payloads spilling into overflow cachelines. There are no descriptor
//! rings and no DMA; see [`transport`] for the exchange itself.
//!
//! # Quick Start
//!
//! ```ignore
//! use lauberhorn::prelude::*;
//!
//! // `memory` is the coherent region mapped by the surrounding runtime.
//! let transport = EciTransport::new(memory, EciConfig::with_cores(4))?;
//! let mut state = transport.core_state(0)?;
//! transport.bring_up(&mut state)?;
//!
//! if let Some(rx) = transport.receive(&mut state)? {
//!     println!("{} with {} payload bytes", rx.kind(), rx.len());
//!     transport.acknowledge_receive(rx);
//! }
//!
//! let mut reply = transport.prepare_transmit(&mut state, TransactionKind::OncRpcReply);
//! reply.payload_mut().extend_from_slice(b"done");
//! transport.transmit(&mut state, reply)?;
//! ```
//!
//! # Bit positions
//!
//! Field positions in the control header are generated together with the
//! FPGA bitstream. [`DEFAULT_FORMAT`] and [`DEFAULT_LAYOUT`] match the
//! reference build; pass your own through [`EciConfig`] otherwise. Both are
//! validated when the transport is created.
//!
//! # Logging
//!
//! Everything is reported through `tracing`. The library never installs a
//! subscriber.

#![forbid(unsafe_op_in_unsafe_fn)]

// Re-export core types
pub use lauberhorn_core::{
    // Cacheline codec
    inline_window,
    Bypass,
    Cacheline,
    ControlCodec,
    ControlFormat,
    ControlHeader,
    Direction,
    EncodeError,
    FormatError,
    HeaderKind,
    InlineBytes,
    LayoutError,
    OncRpc,
    // Region layout
    RegionLayout,
    Transaction,
    TransactionKind,
    CACHELINE_SIZE,
    DEFAULT_FORMAT,
    DEFAULT_LAYOUT,
    ETHERNET_HEADER_LEN,
    INLINE_DATA_SIZE,
    IP_HEADER_LEN,
    UDP_HEADER_LEN,
};

#[cfg(feature = "eci")]
pub use transport::{
    CoherentMemory, CoreState, EciConfig, EciTransport, ExchangeError, Received, SpinLimit,
    TxDescriptor,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use lauberhorn::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{HeaderKind, Transaction, TransactionKind};

    #[cfg(feature = "eci")]
    pub use crate::{CoherentMemory, EciConfig, EciTransport, ExchangeError, SpinLimit};
}

/// The exchange engine over ECI coherent memory, with the memory backends
/// and the worker handshake.
#[cfg(feature = "eci")]
pub mod transport {
    pub use lauberhorn_transport_eci::*;
}

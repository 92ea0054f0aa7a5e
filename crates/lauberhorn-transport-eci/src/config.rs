//! Engine configuration.

use std::fmt;

use lauberhorn_core::{
    ControlFormat, FormatError, LayoutError, RegionLayout, DEFAULT_FORMAT, DEFAULT_LAYOUT,
};

use crate::handshake::SpinLimit;

/// Configuration for an [`EciTransport`](crate::EciTransport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EciConfig {
    pub layout: RegionLayout,
    /// Bit positions generated with the bitstream.
    pub format: ControlFormat,
    /// Handshake spin policy for `receive` and `transmit`.
    pub spin: SpinLimit,
    /// Receive buffer per core. Anything longer fails with
    /// `OverflowExceeded`.
    pub rx_buffer_size: usize,
    /// Capacity reserved for the transmit buffer per core.
    pub tx_buffer_size: usize,
    pub num_cores: usize,
}

impl Default for EciConfig {
    fn default() -> Self {
        let capacity = DEFAULT_LAYOUT.payload_capacity();
        Self {
            layout: DEFAULT_LAYOUT,
            format: DEFAULT_FORMAT,
            spin: SpinLimit::Unbounded,
            rx_buffer_size: capacity,
            tx_buffer_size: capacity,
            num_cores: 1,
        }
    }
}

impl EciConfig {
    /// Default layout and format for `num_cores` cores.
    pub fn with_cores(num_cores: usize) -> Self {
        Self {
            num_cores,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.layout.validate().map_err(ConfigError::Layout)?;
        self.format.validate().map_err(ConfigError::Format)?;
        if self.num_cores == 0 {
            return Err(ConfigError::NoCores);
        }
        let capacity = self.layout.payload_capacity();
        if self.format.max_length() < capacity {
            return Err(ConfigError::LengthFieldTooNarrow {
                max: self.format.max_length(),
                capacity,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    Layout(LayoutError),
    Format(FormatError),
    NoCores,
    /// The `len` field cannot describe a full transaction.
    LengthFieldTooNarrow { max: usize, capacity: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Layout(e) => write!(f, "layout: {e}"),
            ConfigError::Format(e) => write!(f, "control format: {e}"),
            ConfigError::NoCores => f.write_str("at least one core must be mapped"),
            ConfigError::LengthFieldTooNarrow { max, capacity } => write!(
                f,
                "len field holds at most {max}, payload capacity is {capacity}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Layout(e) => Some(e),
            ConfigError::Format(e) => Some(e),
            _ => None,
        }
    }
}

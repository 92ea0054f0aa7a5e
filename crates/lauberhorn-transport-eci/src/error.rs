use std::fmt;

use lauberhorn_core::EncodeError;

use crate::config::ConfigError;

/// Errors from the exchange engine.
///
/// Every variant is returned after the critical section (if one was
/// entered) has been left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// The hardware never set `ready` within the spin policy.
    HandshakeStuck { core: usize, attempts: u64 },
    /// The hardware announced more payload than the receive buffer holds.
    /// Software buffer sizing and hardware MTU disagree.
    OverflowExceeded { len: usize, capacity: usize },
    /// The caller staged more payload than one transaction can carry.
    PayloadTooLarge { len: usize, capacity: usize },
    /// The transaction cannot be put on the wire. Parity was still advanced
    /// and the doorbell rung, in step with the hardware.
    UnsupportedTransmit(EncodeError),
    RegionTooSmall { required: usize, found: usize },
    InvalidCore { core: usize, num_cores: usize },
    /// Another [`CoreState`](crate::CoreState) for this core is still alive.
    CoreInUse { core: usize },
    Config(ConfigError),
}

impl ExchangeError {
    /// Whether trying the same call again later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::HandshakeStuck { .. } | ExchangeError::PayloadTooLarge { .. }
        )
    }
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::HandshakeStuck { core, attempts } => write!(
                f,
                "core {core}: worker handshake not ready after {attempts} attempts"
            ),
            ExchangeError::OverflowExceeded { len, capacity } => write!(
                f,
                "received length {len} exceeds receive buffer capacity {capacity}"
            ),
            ExchangeError::PayloadTooLarge { len, capacity } => {
                write!(f, "payload of {len} bytes exceeds transmit capacity {capacity}")
            }
            ExchangeError::UnsupportedTransmit(e) => write!(f, "unsupported transmit: {e}"),
            ExchangeError::RegionTooSmall { required, found } => write!(
                f,
                "coherent region of {found:#x} bytes, layout requires {required:#x}"
            ),
            ExchangeError::InvalidCore { core, num_cores } => {
                write!(f, "core {core} out of range ({num_cores} cores mapped)")
            }
            ExchangeError::CoreInUse { core } => {
                write!(f, "core {core} already has an owner")
            }
            ExchangeError::Config(e) => write!(f, "invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for ExchangeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExchangeError::UnsupportedTransmit(e) => Some(e),
            ExchangeError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<EncodeError> for ExchangeError {
    fn from(e: EncodeError) -> Self {
        ExchangeError::UnsupportedTransmit(e)
    }
}

impl From<ConfigError> for ExchangeError {
    fn from(e: ConfigError) -> Self {
        ExchangeError::Config(e)
    }
}

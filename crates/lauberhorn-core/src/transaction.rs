//! Transactions carried in a control cacheline.

use std::fmt;

use crate::format::ControlFormat;
use crate::layout::CONTROL_HEADER_SIZE;

/// The `ty` field of a control header, without its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    Bypass,
    OncRpcCall,
    OncRpcReply,
    /// Any tag the codec did not recognise.
    Error,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionKind::Bypass => "bypass",
            TransactionKind::OncRpcCall => "onc-rpc call",
            TransactionKind::OncRpcReply => "onc-rpc reply",
            TransactionKind::Error => "error",
        };
        f.write_str(name)
    }
}

/// How much of a network header a bypass transaction carries.
///
/// Each kind includes the layers below it: `Ip` means Ethernet + IPv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderKind {
    Ethernet,
    Ip,
    Udp,
    Error,
}

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IP_HEADER_LEN: usize = ETHERNET_HEADER_LEN + 20;
pub const UDP_HEADER_LEN: usize = IP_HEADER_LEN + 8;

impl HeaderKind {
    /// Header bytes a bypass transaction of this kind must carry, before
    /// any format clamps it. `None` for `Error`, which has no fixed size.
    pub const fn wire_len(self) -> Option<usize> {
        match self {
            HeaderKind::Ethernet => Some(ETHERNET_HEADER_LEN),
            HeaderKind::Ip => Some(IP_HEADER_LEN),
            HeaderKind::Udp => Some(UDP_HEADER_LEN),
            HeaderKind::Error => None,
        }
    }

    /// Bytes of header carried for this kind. Unknown kinds use the full
    /// header window so copies stay in bounds.
    pub const fn header_len(self, format: &ControlFormat) -> usize {
        let len = match self {
            HeaderKind::Ethernet => ETHERNET_HEADER_LEN,
            HeaderKind::Ip => IP_HEADER_LEN,
            HeaderKind::Udp => UDP_HEADER_LEN,
            HeaderKind::Error => format.bypass_header_size,
        };
        if len > format.bypass_header_size {
            format.bypass_header_size
        } else {
            len
        }
    }
}

/// Up to [`CONTROL_HEADER_SIZE`] bytes copied out of or into the header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct InlineBytes {
    buf: [u8; CONTROL_HEADER_SIZE],
    len: u8,
}

impl InlineBytes {
    /// `len` zero bytes. Lengths past the header size are clamped.
    pub fn zeroed(len: usize) -> Self {
        Self {
            buf: [0; CONTROL_HEADER_SIZE],
            len: len.min(CONTROL_HEADER_SIZE) as u8,
        }
    }

    /// Copy `bytes`, or `None` if they do not fit in a control header.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > CONTROL_HEADER_SIZE {
            return None;
        }
        let mut out = Self::zeroed(bytes.len());
        out.buf[..bytes.len()].copy_from_slice(bytes);
        Some(out)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len()]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len();
        &mut self.buf[..len]
    }

    /// Little-endian 32-bit word `index`.
    pub fn word(&self, index: usize) -> Option<u32> {
        let chunk = self.as_slice().chunks_exact(4).nth(index)?;
        Some(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }

    /// Set word `index`; returns `false` if it is out of range.
    pub fn set_word(&mut self, index: usize, value: u32) -> bool {
        match self.as_mut_slice().chunks_exact_mut(4).nth(index) {
            Some(chunk) => {
                chunk.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    pub fn words(&self) -> impl Iterator<Item = u32> + '_ {
        self.as_slice()
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
    }
}

impl fmt::Debug for InlineBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

/// Fields of a bypass transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bypass {
    pub header_kind: HeaderKind,
    /// Raw header, `header_kind.header_len()` bytes long.
    pub header: InlineBytes,
}

/// Fields shared by ONC-RPC calls and replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OncRpc {
    /// Opaque handler token. Only meaningful on calls.
    pub func_ptr: u64,
    pub xid: u32,
    /// Inline argument (call) or result (reply) words.
    pub words: InlineBytes,
}

/// A decoded or to-be-encoded transaction, one variant per `ty` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transaction {
    Bypass(Bypass),
    OncRpcCall(OncRpc),
    OncRpcReply(OncRpc),
    /// Hardware sent a tag outside the known set.
    Error { tag: u64 },
}

impl Transaction {
    pub fn kind(&self) -> TransactionKind {
        match self {
            Transaction::Bypass(_) => TransactionKind::Bypass,
            Transaction::OncRpcCall(_) => TransactionKind::OncRpcCall,
            Transaction::OncRpcReply(_) => TransactionKind::OncRpcReply,
            Transaction::Error { .. } => TransactionKind::Error,
        }
    }

    /// A zeroed transaction of `kind`, sized for `format`.
    pub fn empty(kind: TransactionKind, format: &ControlFormat) -> Self {
        let rpc = || OncRpc {
            func_ptr: 0,
            xid: 0,
            words: InlineBytes::zeroed(format.rpc_args_size()),
        };
        match kind {
            TransactionKind::Bypass => Transaction::Bypass(Bypass {
                header_kind: HeaderKind::Ethernet,
                header: InlineBytes::zeroed(HeaderKind::Ethernet.header_len(format)),
            }),
            TransactionKind::OncRpcCall => Transaction::OncRpcCall(rpc()),
            TransactionKind::OncRpcReply => Transaction::OncRpcReply(rpc()),
            TransactionKind::Error => Transaction::Error { tag: 0 },
        }
    }

    /// Build a bypass transaction from a raw header.
    ///
    /// `None` if `header` is not exactly [`HeaderKind::wire_len`] bytes, or
    /// does not fit a control header at all.
    pub fn bypass(header_kind: HeaderKind, header: &[u8]) -> Option<Self> {
        if header_kind.wire_len().is_some_and(|len| len != header.len()) {
            return None;
        }
        Some(Transaction::Bypass(Bypass {
            header_kind,
            header: InlineBytes::from_slice(header)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DEFAULT_FORMAT;

    #[test]
    fn header_lengths_are_cumulative() {
        assert_eq!(HeaderKind::Ethernet.header_len(&DEFAULT_FORMAT), 14);
        assert_eq!(HeaderKind::Ip.header_len(&DEFAULT_FORMAT), 34);
        assert_eq!(HeaderKind::Udp.header_len(&DEFAULT_FORMAT), 42);
        assert_eq!(
            HeaderKind::Error.header_len(&DEFAULT_FORMAT),
            DEFAULT_FORMAT.bypass_header_size
        );
    }

    #[test]
    fn header_len_clamped_to_window() {
        let format = ControlFormat {
            bypass_header_size: 20,
            ..DEFAULT_FORMAT
        };
        assert_eq!(HeaderKind::Udp.header_len(&format), 20);
    }

    #[test]
    fn bypass_requires_exact_header_length() {
        assert!(Transaction::bypass(HeaderKind::Ethernet, &[0; ETHERNET_HEADER_LEN]).is_some());
        assert!(Transaction::bypass(HeaderKind::Ethernet, &[0; 30]).is_none());
        assert!(Transaction::bypass(HeaderKind::Ip, &[0; ETHERNET_HEADER_LEN]).is_none());
        assert!(Transaction::bypass(HeaderKind::Udp, &[0; UDP_HEADER_LEN + 1]).is_none());
        // No fixed size for unknown kinds; only the window bounds them.
        assert!(Transaction::bypass(HeaderKind::Error, &[0; 3]).is_some());
        assert!(Transaction::bypass(HeaderKind::Error, &[0; CONTROL_HEADER_SIZE + 1]).is_none());
    }

    #[test]
    fn inline_words() {
        let mut words = InlineBytes::zeroed(8);
        assert!(words.set_word(1, 0xaabb_ccdd));
        assert!(!words.set_word(2, 1));
        assert_eq!(words.word(1), Some(0xaabb_ccdd));
        assert_eq!(words.word(2), None);
        assert_eq!(words.words().collect::<Vec<_>>(), vec![0, 0xaabb_ccdd]);
        assert_eq!(&words.as_slice()[4..], &[0xdd, 0xcc, 0xbb, 0xaa]);
    }

    #[test]
    fn inline_bytes_reject_oversized() {
        assert!(InlineBytes::from_slice(&[0u8; CONTROL_HEADER_SIZE]).is_some());
        assert!(InlineBytes::from_slice(&[0u8; CONTROL_HEADER_SIZE + 1]).is_none());
    }

    #[test]
    fn empty_transactions_match_kind() {
        for kind in [
            TransactionKind::Bypass,
            TransactionKind::OncRpcCall,
            TransactionKind::OncRpcReply,
            TransactionKind::Error,
        ] {
            assert_eq!(Transaction::empty(kind, &DEFAULT_FORMAT).kind(), kind);
        }
        match Transaction::empty(TransactionKind::OncRpcCall, &DEFAULT_FORMAT) {
            Transaction::OncRpcCall(rpc) => assert_eq!(rpc.words.len(), 44),
            other => panic!("unexpected {other:?}"),
        }
    }
}

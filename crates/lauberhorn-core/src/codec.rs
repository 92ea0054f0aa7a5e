//! Control cacheline codec.
//!
//! [`ControlCodec::decode`] is total: any 128 bytes decode to a
//! [`ControlHeader`], and tags outside the known set come back as
//! [`Transaction::Error`] without touching type-specific fields.

use std::fmt;

use crate::format::{ControlFormat, FormatError};
use crate::layout::{CACHELINE_SIZE, CONTROL_HEADER_SIZE, INLINE_DATA_OFFSET, INLINE_DATA_SIZE};
use crate::transaction::{Bypass, HeaderKind, InlineBytes, OncRpc, Transaction, TransactionKind};

/// One raw cacheline.
pub type Cacheline = [u8; CACHELINE_SIZE];

/// Decoded control header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    pub valid: bool,
    /// Payload bytes (inline + overflow), excluding the control header.
    pub length: usize,
    pub transaction: Transaction,
}

/// Errors from [`ControlCodec::encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// Transactions of this kind are never put on the wire by the host.
    UnsupportedKind(TransactionKind),
    UnsupportedHeader(HeaderKind),
    /// `length` does not fit the `len` field.
    LengthOverflow { length: usize, max: usize },
    /// A bypass header whose size disagrees with its `hdr_ty`.
    HeaderLength {
        kind: HeaderKind,
        len: usize,
        expected: usize,
    },
    /// A variable-size part does not fit its window.
    TooLarge {
        what: &'static str,
        len: usize,
        max: usize,
    },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::UnsupportedKind(kind) => {
                write!(f, "cannot encode a {kind} transaction")
            }
            EncodeError::UnsupportedHeader(kind) => {
                write!(f, "cannot encode bypass header kind {kind:?}")
            }
            EncodeError::LengthOverflow { length, max } => {
                write!(f, "length {length} exceeds the len field maximum {max}")
            }
            EncodeError::HeaderLength {
                kind,
                len,
                expected,
            } => {
                write!(f, "{kind:?} header is {len} bytes, expected {expected}")
            }
            EncodeError::TooLarge { what, len, max } => {
                write!(f, "{what} is {len} bytes, at most {max} fit")
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// The inline payload half of a control cacheline.
#[inline]
pub fn inline_window(cl: &Cacheline) -> &[u8] {
    &cl[INLINE_DATA_OFFSET..]
}

/// Encoder/decoder for one [`ControlFormat`].
#[derive(Debug, Clone)]
pub struct ControlCodec {
    format: ControlFormat,
}

impl ControlCodec {
    pub fn new(format: ControlFormat) -> Result<Self, FormatError> {
        format.validate()?;
        Ok(Self { format })
    }

    #[inline]
    pub fn format(&self) -> &ControlFormat {
        &self.format
    }

    /// Only the `valid` bit.
    #[inline]
    pub fn is_valid(&self, cl: &Cacheline) -> bool {
        self.format.valid.extract(cl) == 1
    }

    pub fn decode(&self, cl: &Cacheline) -> ControlHeader {
        let header = &cl[..CONTROL_HEADER_SIZE];
        let f = &self.format;
        let tag = f.ty.extract(header);
        let valid = f.valid.extract(header) == 1;

        let transaction = if tag == f.tags.bypass {
            Transaction::Bypass(self.decode_bypass(header))
        } else if tag == f.tags.onc_rpc_call {
            Transaction::OncRpcCall(self.decode_rpc(header))
        } else if tag == f.tags.onc_rpc_reply {
            Transaction::OncRpcReply(self.decode_rpc(header))
        } else {
            if valid {
                tracing::trace!(tag, "unrecognised transaction tag");
            }
            Transaction::Error { tag }
        };

        ControlHeader {
            valid,
            length: f.len.extract(header) as usize,
            transaction,
        }
    }

    fn decode_bypass(&self, header: &[u8]) -> Bypass {
        let f = &self.format;
        let code = f.hdr_ty.extract(header);
        let header_kind = if code == f.tags.hdr_ethernet {
            HeaderKind::Ethernet
        } else if code == f.tags.hdr_ip {
            HeaderKind::Ip
        } else if code == f.tags.hdr_udp {
            HeaderKind::Udp
        } else {
            HeaderKind::Error
        };

        let len = header_kind.header_len(f);
        let start = f.bypass_header_offset;
        let mut bytes = InlineBytes::zeroed(len);
        bytes
            .as_mut_slice()
            .copy_from_slice(&header[start..start + len]);
        Bypass {
            header_kind,
            header: bytes,
        }
    }

    fn decode_rpc(&self, header: &[u8]) -> OncRpc {
        let f = &self.format;
        let start = f.rpc_args_offset;
        let len = f.rpc_args_size();
        let mut words = InlineBytes::zeroed(len);
        words
            .as_mut_slice()
            .copy_from_slice(&header[start..start + len]);
        OncRpc {
            func_ptr: f.func_ptr.extract(header),
            xid: f.xid.extract(header) as u32,
            words,
        }
    }

    /// Produce a valid control cacheline for `transaction`.
    ///
    /// `length` is the full payload length; `inline` is its first
    /// `min(length, INLINE_DATA_SIZE)` bytes. Matching the two is the
    /// caller's job.
    pub fn encode(
        &self,
        transaction: &Transaction,
        length: usize,
        inline: &[u8],
    ) -> Result<Cacheline, EncodeError> {
        let f = &self.format;
        if inline.len() > INLINE_DATA_SIZE {
            return Err(EncodeError::TooLarge {
                what: "inline payload",
                len: inline.len(),
                max: INLINE_DATA_SIZE,
            });
        }
        if length > f.max_length() {
            return Err(EncodeError::LengthOverflow {
                length,
                max: f.max_length(),
            });
        }

        let mut cl = [0u8; CACHELINE_SIZE];
        let header = &mut cl[..CONTROL_HEADER_SIZE];
        match transaction {
            Transaction::Bypass(bypass) => {
                let code = match bypass.header_kind {
                    HeaderKind::Ethernet => f.tags.hdr_ethernet,
                    HeaderKind::Ip => f.tags.hdr_ip,
                    HeaderKind::Udp => f.tags.hdr_udp,
                    HeaderKind::Error => {
                        return Err(EncodeError::UnsupportedHeader(HeaderKind::Error))
                    }
                };
                let bytes = bypass.header.as_slice();
                let expected = bypass.header_kind.header_len(f);
                if bytes.len() != expected {
                    return Err(EncodeError::HeaderLength {
                        kind: bypass.header_kind,
                        len: bytes.len(),
                        expected,
                    });
                }
                f.ty.insert(header, f.tags.bypass);
                f.hdr_ty.insert(header, code);
                let start = f.bypass_header_offset;
                header[start..start + bytes.len()].copy_from_slice(bytes);
            }
            Transaction::OncRpcCall(rpc) | Transaction::OncRpcReply(rpc) => {
                let words = rpc.words.as_slice();
                if words.len() > f.rpc_args_size() {
                    return Err(EncodeError::TooLarge {
                        what: "rpc inline words",
                        len: words.len(),
                        max: f.rpc_args_size(),
                    });
                }
                let tag = if matches!(transaction, Transaction::OncRpcCall(_)) {
                    f.tags.onc_rpc_call
                } else {
                    f.tags.onc_rpc_reply
                };
                f.ty.insert(header, tag);
                f.func_ptr.insert(header, rpc.func_ptr);
                f.xid.insert(header, u64::from(rpc.xid));
                let start = f.rpc_args_offset;
                header[start..start + words.len()].copy_from_slice(words);
            }
            Transaction::Error { .. } => {
                return Err(EncodeError::UnsupportedKind(TransactionKind::Error));
            }
        }
        f.len.insert(header, length as u64);
        f.valid.insert(header, 1);

        cl[INLINE_DATA_OFFSET..INLINE_DATA_OFFSET + inline.len()].copy_from_slice(inline);
        Ok(cl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DEFAULT_FORMAT;

    fn codec() -> ControlCodec {
        ControlCodec::new(DEFAULT_FORMAT).unwrap()
    }

    #[test]
    fn zeroed_cacheline_is_invalid() {
        let codec = codec();
        let cl = [0u8; CACHELINE_SIZE];
        let header = codec.decode(&cl);
        assert!(!header.valid);
        assert!(!codec.is_valid(&cl));
        assert_eq!(header.transaction, Transaction::Error { tag: 0 });
    }

    #[test]
    fn bypass_round_trip() {
        let codec = codec();
        let eth: Vec<u8> = (0..14).collect();
        let tx = Transaction::bypass(HeaderKind::Ethernet, &eth).unwrap();
        let payload = [0x5a; 40];

        let cl = codec.encode(&tx, payload.len(), &payload).unwrap();
        assert_eq!(cl[0] & 1, 1, "valid lives in bit 0");
        assert_eq!(&inline_window(&cl)[..40], &payload);

        let header = codec.decode(&cl);
        assert!(header.valid);
        assert_eq!(header.length, 40);
        assert_eq!(header.transaction, tx);
    }

    #[test]
    fn rpc_call_and_reply_keep_their_tag() {
        let codec = codec();
        let mut words = InlineBytes::zeroed(DEFAULT_FORMAT.rpc_args_size());
        words.set_word(0, 7);
        words.set_word(10, 0xffff_ffff);
        let rpc = OncRpc {
            func_ptr: 0xffff_8000_dead_beef,
            xid: 0x1234_5678,
            words,
        };

        for tx in [Transaction::OncRpcCall(rpc), Transaction::OncRpcReply(rpc)] {
            let cl = codec.encode(&tx, 200, &[1; 64]).unwrap();
            let header = codec.decode(&cl);
            assert_eq!(header.length, 200);
            assert_eq!(header.transaction, tx);
        }
    }

    #[test]
    fn unknown_tag_decodes_to_error() {
        let codec = codec();
        let mut cl = [0xffu8; CACHELINE_SIZE];
        // ty = 0xf is outside {1, 2, 3}.
        let header = codec.decode(&cl);
        assert!(header.valid);
        assert_eq!(header.transaction, Transaction::Error { tag: 0xf });

        DEFAULT_FORMAT.ty.insert(&mut cl, 9);
        assert_eq!(codec.decode(&cl).transaction, Transaction::Error { tag: 9 });
    }

    /// Counts events emitted while it is the default subscriber.
    #[derive(Clone, Default)]
    struct EventCount(std::sync::Arc<std::sync::atomic::AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for EventCount {
        fn on_event(
            &self,
            _event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    #[test]
    fn only_valid_lines_report_unknown_tags() {
        use tracing_subscriber::layer::SubscriberExt;

        let codec = codec();
        let events = EventCount::default();
        let subscriber = tracing_subscriber::registry().with(events.clone());
        let seen = || events.0.load(std::sync::atomic::Ordering::Relaxed);

        tracing::subscriber::with_default(subscriber, || {
            codec.decode(&[0u8; CACHELINE_SIZE]);
            assert_eq!(seen(), 0, "empty poll logged");

            let mut cl = [0u8; CACHELINE_SIZE];
            DEFAULT_FORMAT.valid.insert(&mut cl, 1);
            DEFAULT_FORMAT.ty.insert(&mut cl, 9);
            codec.decode(&cl);
            assert_eq!(seen(), 1);
        });
    }

    #[test]
    fn unknown_header_kind_uses_full_window() {
        let codec = codec();
        let mut cl = [0u8; CACHELINE_SIZE];
        DEFAULT_FORMAT.valid.insert(&mut cl, 1);
        DEFAULT_FORMAT.ty.insert(&mut cl, DEFAULT_FORMAT.tags.bypass);
        DEFAULT_FORMAT.hdr_ty.insert(&mut cl, 7);
        let header = codec.decode(&cl);
        match header.transaction {
            Transaction::Bypass(bypass) => {
                assert_eq!(bypass.header_kind, HeaderKind::Error);
                assert_eq!(bypass.header.len(), DEFAULT_FORMAT.bypass_header_size);
            }
            other => panic!("expected bypass, got {other:?}"),
        }
    }

    #[test]
    fn encode_rejects_error_kinds() {
        let codec = codec();
        assert_eq!(
            codec.encode(&Transaction::Error { tag: 4 }, 0, &[]),
            Err(EncodeError::UnsupportedKind(TransactionKind::Error))
        );
        let tx = Transaction::bypass(HeaderKind::Error, &[0; 14]).unwrap();
        assert_eq!(
            codec.encode(&tx, 0, &[]),
            Err(EncodeError::UnsupportedHeader(HeaderKind::Error))
        );
    }

    #[test]
    fn encode_rejects_oversized_parts() {
        let codec = codec();
        let tx = Transaction::bypass(HeaderKind::Ethernet, &[0; 14]).unwrap();
        assert!(matches!(
            codec.encode(&tx, 65, &[0; 65]),
            Err(EncodeError::TooLarge { .. })
        ));
        assert!(matches!(
            codec.encode(&tx, 1 << 14, &[]),
            Err(EncodeError::LengthOverflow { .. })
        ));
    }

    fn bypass_with(kind: HeaderKind, len: usize) -> Transaction {
        Transaction::Bypass(Bypass {
            header_kind: kind,
            header: InlineBytes::zeroed(len),
        })
    }

    #[test]
    fn encode_rejects_mismatched_bypass_header() {
        let codec = codec();

        // Longer than the kind carries: would be cut to 14 bytes on decode.
        assert_eq!(
            codec.encode(&bypass_with(HeaderKind::Ethernet, 30), 0, &[]),
            Err(EncodeError::HeaderLength {
                kind: HeaderKind::Ethernet,
                len: 30,
                expected: 14,
            })
        );

        // Shorter: an empty bypass relabelled as IP would decode zero-padded.
        let mut tx = Transaction::empty(TransactionKind::Bypass, &DEFAULT_FORMAT);
        if let Transaction::Bypass(bypass) = &mut tx {
            bypass.header_kind = HeaderKind::Ip;
        }
        assert_eq!(
            codec.encode(&tx, 0, &[]),
            Err(EncodeError::HeaderLength {
                kind: HeaderKind::Ip,
                len: 14,
                expected: 34,
            })
        );

        assert!(codec.encode(&bypass_with(HeaderKind::Ip, 34), 0, &[]).is_ok());
    }

    #[test]
    fn header_length_follows_format_window() {
        let codec = ControlCodec::new(ControlFormat {
            bypass_header_size: 20,
            ..DEFAULT_FORMAT
        })
        .unwrap();
        assert!(codec.encode(&bypass_with(HeaderKind::Udp, 20), 0, &[]).is_ok());
        assert!(matches!(
            codec.encode(&bypass_with(HeaderKind::Udp, 42), 0, &[]),
            Err(EncodeError::HeaderLength { expected: 20, .. })
        ));
    }
}

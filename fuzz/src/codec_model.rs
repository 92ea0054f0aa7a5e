//! Properties of the control-cacheline codec.

use lauberhorn_core::{
    inline_window, Bypass, Cacheline, ControlCodec, HeaderKind, InlineBytes, OncRpc, Transaction,
    CACHELINE_SIZE, DEFAULT_FORMAT,
};

/// Inputs for one encode/decode round trip.
#[derive(Debug, Clone, bolero::TypeGenerator)]
pub struct EncodeInput {
    pub kind: u8,
    pub header_kind: u8,
    pub header_seed: u8,
    pub length: u16,
    pub func_ptr: u64,
    pub xid: u32,
    pub words: [u32; 11],
}

pub fn default_codec() -> ControlCodec {
    ControlCodec::new(DEFAULT_FORMAT).expect("default format is valid")
}

/// Decoding never fails; whatever the bytes, the header reflects the raw
/// fields and unknown tags come back as `Error`.
pub fn check_decode(codec: &ControlCodec, bytes: &[u8]) {
    let mut cl: Cacheline = [0; CACHELINE_SIZE];
    let n = bytes.len().min(CACHELINE_SIZE);
    cl[..n].copy_from_slice(&bytes[..n]);

    let format = codec.format();
    let header = codec.decode(&cl);
    assert_eq!(header.valid, format.valid.extract(&cl) == 1);
    assert_eq!(header.valid, codec.is_valid(&cl));
    assert_eq!(header.length as u64, format.len.extract(&cl));

    let tag = format.ty.extract(&cl);
    let tags = format.tags;
    match header.transaction {
        Transaction::Bypass(bypass) => {
            assert_eq!(tag, tags.bypass);
            assert_eq!(bypass.header.len(), bypass.header_kind.header_len(format));
        }
        Transaction::OncRpcCall(rpc) => {
            assert_eq!(tag, tags.onc_rpc_call);
            assert_eq!(rpc.words.len(), format.rpc_args_size());
        }
        Transaction::OncRpcReply(_) => assert_eq!(tag, tags.onc_rpc_reply),
        Transaction::Error { tag: reported } => {
            assert_eq!(reported, tag);
            assert!(![tags.bypass, tags.onc_rpc_call, tags.onc_rpc_reply].contains(&tag));
        }
    }
}

/// Build the transaction described by `input`, sized so decode can
/// reproduce it exactly.
pub fn transaction_for(codec: &ControlCodec, input: &EncodeInput) -> Transaction {
    let format = codec.format();
    match input.kind % 4 {
        0 => {
            let header_kind = match input.header_kind % 4 {
                0 => HeaderKind::Ethernet,
                1 => HeaderKind::Ip,
                2 => HeaderKind::Udp,
                _ => HeaderKind::Error,
            };
            let mut header = InlineBytes::zeroed(header_kind.header_len(format));
            for (i, b) in header.as_mut_slice().iter_mut().enumerate() {
                *b = input.header_seed.wrapping_add(i as u8);
            }
            Transaction::Bypass(Bypass {
                header_kind,
                header,
            })
        }
        kind => {
            let mut words = InlineBytes::zeroed(format.rpc_args_size());
            for (i, w) in input.words.iter().enumerate() {
                words.set_word(i, *w);
            }
            let rpc = OncRpc {
                func_ptr: input.func_ptr,
                xid: input.xid,
                words,
            };
            match kind {
                1 => Transaction::OncRpcCall(rpc),
                2 => Transaction::OncRpcReply(rpc),
                _ => Transaction::Error {
                    tag: u64::from(input.header_seed),
                },
            }
        }
    }
}

/// Encode then decode; anything the codec accepts must come back as-is.
pub fn check_round_trip(codec: &ControlCodec, input: &EncodeInput) {
    let transaction = transaction_for(codec, input);
    let length = input.length as usize;
    let inline: Vec<u8> = (0..length.min(64)).map(|i| i as u8 ^ input.header_seed).collect();

    let cl = match codec.encode(&transaction, length, &inline) {
        Ok(cl) => cl,
        Err(_) => {
            let unencodable = matches!(
                transaction,
                Transaction::Error { .. }
                    | Transaction::Bypass(Bypass {
                        header_kind: HeaderKind::Error,
                        ..
                    })
            ) || length > codec.format().max_length();
            assert!(unencodable, "rejected an encodable {transaction:?}");
            return;
        }
    };

    let header = codec.decode(&cl);
    assert!(header.valid);
    assert_eq!(header.length, length);
    assert_eq!(header.transaction, transaction);
    assert_eq!(&inline_window(&cl)[..inline.len()], &inline[..]);
}

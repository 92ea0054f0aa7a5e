//! Loopback against the software FPGA model.
//!
//! This example shows:
//! - Bringing up two cores on one coherent region
//! - Transmitting a bypass frame that spills into an overflow cacheline and
//!   receiving it back
//! - Answering an ONC-RPC call injected by the "hardware"
//!
//! Run with: `cargo run --example loopback -p lauberhorn`
//! (set `RUST_LOG=lauberhorn_transport_eci=debug` to watch the handshake)

use lauberhorn::prelude::*;
use lauberhorn::{InlineBytes, OncRpc, ETHERNET_HEADER_LEN};
use lauberhorn_testkit::NicModel;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lauberhorn_transport_eci=info")),
        )
        .init();

    let config = EciConfig::with_cores(2);
    let model = NicModel::new(&config)?;
    let transport = EciTransport::new(model, config)?;

    let mut net = transport.core_state(0)?;
    let mut rpc = transport.core_state(1)?;
    transport.bring_up(&mut net)?;
    transport.bring_up(&mut rpc)?;

    // Core 0: a bypass frame out and back again.
    transport.memory().set_loopback(0, true);
    let header: Vec<u8> = (0..ETHERNET_HEADER_LEN as u8).collect();
    let frame = Transaction::bypass(HeaderKind::Ethernet, &header).ok_or("header too long")?;

    let mut desc = transport.prepare_transmit(&mut net, TransactionKind::Bypass);
    desc.set_transaction(frame);
    desc.payload_mut().extend((0..100u8).map(|i| i.wrapping_mul(3)));
    transport.transmit(&mut net, desc)?;

    if let Some(rx) = transport.receive(&mut net)? {
        println!(
            "core 0: looped back {} with {} payload bytes",
            rx.kind(),
            rx.len()
        );
        transport.acknowledge_receive(rx);
    }

    // Core 1: the hardware delivers a call, the host answers it.
    let mut words = InlineBytes::zeroed(transport.config().format.rpc_args_size());
    words.set_word(0, 20);
    words.set_word(1, 22);
    let call = Transaction::OncRpcCall(OncRpc {
        func_ptr: 0x4000_1000,
        xid: 7,
        words,
    });
    transport.memory().inject(1, &call, b"add")?;

    let (xid, sum) = match transport.receive(&mut rpc)? {
        Some(rx) => {
            let answer = match rx.transaction() {
                Transaction::OncRpcCall(call) => (call.xid, call.words.words().take(2).sum::<u32>()),
                other => return Err(format!("expected a call, got {other:?}").into()),
            };
            transport.acknowledge_receive(rx);
            answer
        }
        None => return Err("no call pending on core 1".into()),
    };

    let mut reply = transport.prepare_transmit(&mut rpc, TransactionKind::OncRpcReply);
    if let Transaction::OncRpcReply(fields) = reply.transaction_mut() {
        fields.xid = xid;
        fields.words.set_word(0, sum);
    }
    transport.transmit(&mut rpc, reply)?;

    for packet in transport.memory().take_transmitted(1) {
        println!("core 1: replied {:?}", packet.transaction);
    }

    println!("core 0: {}", net.stats());
    println!("core 1: {}", rpc.stats());
    Ok(())
}

//! Bolero fuzzer for the control-cacheline codec.
//!
//! Properties tested:
//! - Decoding arbitrary bytes never fails and matches the raw fields
//! - Everything the encoder accepts decodes back to the same transaction

use bolero::check;
use lauberhorn_fuzz::codec_model::{check_decode, check_round_trip, default_codec, EncodeInput};

fn main() {
    let codec = default_codec();

    check!().with_type::<(Vec<u8>, EncodeInput)>().for_each(|(bytes, input)| {
        check_decode(&codec, bytes);
        check_round_trip(&codec, input);
    });
}

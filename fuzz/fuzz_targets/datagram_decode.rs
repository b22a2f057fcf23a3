//! Negative-space fuzzer for datagram decoding.
//!
//! Feeds arbitrary bytes to all three package decoders, both raw and with
//! a valid magic/header spliced in front so the fuzzer spends its time on
//! the body codec instead of bouncing off the magic check. Decoding must
//! never panic; whatever decodes must re-encode and decode to the same
//! package.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_proto::{AckBitfield, ClientPackage, Header, Package, Seq, ServerPackage};

fn exercise(datagram: &[u8]) {
    if let Ok(package) = Package::from_datagram(datagram) {
        if let Ok(bytes) = package.to_datagram() {
            let again = Package::from_datagram(&bytes).expect("re-decode of valid package");
            assert_eq!(package, again);
        }
    }
    if let Ok(package) = ClientPackage::from_datagram(datagram) {
        if let Ok(bytes) = package.to_datagram() {
            let again =
                ClientPackage::from_datagram(&bytes).expect("re-decode of valid package");
            assert_eq!(package, again);
        }
    }
    if let Ok(package) = ServerPackage::from_datagram(datagram) {
        if let Ok(bytes) = package.to_datagram() {
            let again =
                ServerPackage::from_datagram(&bytes).expect("re-decode of valid package");
            assert_eq!(package, again);
        }
    }
}

fuzz_target!(|data: &[u8]| {
    // Raw bytes: almost always a magic mismatch, still must not panic.
    exercise(data);

    // Valid header in front, fuzzer-controlled body behind.
    let header = Header {
        sequence: Seq::new(1),
        ack: Seq::NEVER,
        ack_bitfield: AckBitfield::EMPTY,
    };
    let mut framed = header.encode().to_vec();
    framed.extend_from_slice(data);
    exercise(&framed);
});

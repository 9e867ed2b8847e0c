#![no_main]

//! Feeds arbitrary bytes to the inbound side of a peer: the frame header, the packet decoding and the
//! signature check all have to reject garbage without panicking, and without ever reading beyond the
//! payload bound.

use libfuzzer_sys::fuzz_target;
use peerwire::{packet::Packet, testing::peer_with_raw_remote, BufferPool};
use tokio::io::AsyncWriteExt;

// no need for a large size, since the frames are read from memory; this value should be
// equal to or greater than the `max_len` argument passed to `cargo-fuzz`
const MAX_PAYLOAD_SIZE: usize = 4096;

fuzz_target!(|data: &[u8]| {
    // a raw payload must either decode or be rejected
    let _ = Packet::decode(data);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    rt.block_on(async {
        let pool = BufferPool::new(256, 4);
        let (peer, _, mut remote) = peer_with_raw_remote(&pool, MAX_PAYLOAD_SIZE);

        remote.write_all(data).await.unwrap();
        // the end of the stream terminates the loop below
        drop(remote);

        loop {
            match peer.receive().await {
                Ok(_) => {}
                Err(e) if e.is_disconnect() => break,
                // the framing can't be trusted after an oversized header
                Err(peerwire::Error::MaxPayloadExceeded { .. }) => break,
                Err(_) => {}
            }
        }
    });
});

#![no_main]

use libfuzzer_sys::fuzz_target;

use multilink::link::Link;
use multilink::transport::{MockTransport, ReliableTransport};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    // Feed arbitrary bytes as raw wire data into the segment parser and
    // drain the stream ids the input itself suggests, plus stream 0.
    let (raw, parsed) = MockTransport::pair();
    let link = Link::new(parsed);

    for chunk in data.chunks(4096) {
        raw.send(chunk);
    }

    let mut buf = [0u8; 512];
    let mut message = multilink::Message::new();
    for &stream in data.iter().take(64) {
        let _ = link.receive_on(stream, &mut buf);
        let _ = link.receive_message_on(stream, &mut message);
        let _ = link.receive_on(0, &mut buf);
    }
});

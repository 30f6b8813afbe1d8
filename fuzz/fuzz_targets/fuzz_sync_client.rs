#![no_main]

use libfuzzer_sys::fuzz_target;

use multilink::link::Link;
use multilink::sync::{
    Replicated, SmallVec, SYNC_STREAM_ID, SyncClass, Synced, SyncedMember, SynchronizerClient,
    smallvec,
};
use multilink::transport::MockTransport;

struct Target {
    a: Synced<u32>,
    b: Synced<String>,
    c: Synced<i64>,
}

impl Replicated for Target {
    fn object_type_id(&self) -> u32 {
        1
    }

    fn members(&mut self) -> SmallVec<[&mut dyn SyncedMember; 8]> {
        smallvec![&mut self.a, &mut self.b, &mut self.c]
    }
}

fuzz_target!(|data: &[u8]| {
    // Deliver arbitrary frames on the synchronization stream: the replica
    // must log-and-skip garbage without panicking.
    let (raw, wrapped) = MockTransport::pair();
    let feeder = Link::new(raw);
    let link = Link::new(wrapped);

    let mut client = SynchronizerClient::new();
    client.set_lifetime_managers(
        1,
        || {
            Box::new(Target {
                a: Synced::new(SyncClass::Static, 0),
                b: Synced::new(SyncClass::Dynamic, String::new()),
                c: Synced::new(SyncClass::Stream, 0),
            })
        },
        |_object| {},
    );
    client.add_server(&link);

    for chunk in data.chunks(1024) {
        let mut frame = multilink::Message::new();
        frame.append(chunk);
        feeder.send_message_on(SYNC_STREAM_ID, &frame);
        client.update();
    }
});

#![no_main]

use libfuzzer_sys::fuzz_target;

use multilink::Message;

fuzz_target!(|data: &[u8]| {
    // Decode arbitrary bytes as every wire shape the codec knows.
    let mut message = Message::from(data.to_vec());
    let _ = message.pop::<u64>();
    let _ = message.pop::<String>();
    let _ = message.pop::<Vec<u32>>();
    let _ = message.pop::<Vec<Vec<u8>>>();
    let _ = message.pop::<f64>();
    let _ = message.pop::<bool>();

    // Front/back operations on whatever remains.
    let len = message.len();
    let _ = message.front(len);
    let _ = message.back(len / 2);
    let _ = message.pop_back(len / 3);
    let _ = message.pop_front(message.len());
});

#![no_main]

use flock_link::protocol::{Frame, VerifyAuthAck};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Raw bytes, including invalid UTF-8.
    let _ = serde_json::from_slice::<Frame>(data);

    if let Ok(s) = std::str::from_utf8(data) {
        // Acks are decoded a second time into their payload type.
        if let Ok(Frame::Ack { data, .. }) = serde_json::from_str::<Frame>(s) {
            let _ = serde_json::from_value::<VerifyAuthAck>(data);
        }
    }
});

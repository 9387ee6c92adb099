#![no_main]

use flock_link::notifications::{Notification, SNIPPET_CHARS};
use flock_link::protocol::NewMessagePayload;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(payload) = serde_json::from_slice::<NewMessagePayload>(data) {
        // Snippets must stay within the character budget plus the ellipsis.
        let notification = Notification::from_message(&payload.message);
        assert!(notification.snippet.chars().count() <= SNIPPET_CHARS + 1);
    }
});

use std::io::{Write, stdout};
use std::sync::{Mutex, PoisonError};

use salon_chat::{LiveMessage, MemoryStreamingStore, StreamingStore};

/// Streaming store decorator that echoes text deltas to stdout as they
/// arrive, so the terminal shows the response typing in.
#[derive(Default)]
pub struct StdoutStreamingPrinter {
    inner: MemoryStreamingStore,
    printed: Mutex<String>,
}

impl StdoutStreamingPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    fn printed(&self) -> std::sync::MutexGuard<'_, String> {
        self.printed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StreamingStore for StdoutStreamingPrinter {
    fn publish(&self, message: LiveMessage) {
        let mut printed = self.printed();
        if let Some(delta) = message.text.strip_prefix(printed.as_str()) {
            if !delta.is_empty() {
                print!("{delta}");
                let _ = stdout().flush();
                printed.push_str(delta);
            }
        }
        drop(printed);
        self.inner.publish(message);
    }

    fn clear(&self) {
        let mut printed = self.printed();
        if !printed.is_empty() {
            println!();
            printed.clear();
        }
        drop(printed);
        self.inner.clear();
    }

    fn current(&self) -> Option<LiveMessage> {
        self.inner.current()
    }
}

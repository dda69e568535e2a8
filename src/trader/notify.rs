//! Trade-event notification seam. The real chat webhook adapter lives
//! outside the core; the default just logs.

use async_trait::async_trait;
use tracing::info;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, msg: &str);
}

/// Default notifier: emit the event into the log stream.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, msg: &str) {
        info!("🔔 {msg}");
    }
}


use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// What one `index-site` invocation should do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRequest {
    pub site: String,
    pub content_type: String,
    #[serde(default)]
    pub publish: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout: Duration,
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_publish_timeout() -> Duration {
    DEFAULT_PUBLISH_TIMEOUT
}

impl IndexRequest {
    pub fn new(site: impl Into<String>, content_type: impl Into<String>) -> Self {
        IndexRequest {
            site: site.into(),
            content_type: content_type.into(),
            publish: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn trace_loaded(&self) {
        info!(
            site = %self.site,
            content_type = %self.content_type,
            publish = self.publish,
            "Loaded IndexRequest"
        );
        debug!(?self, "IndexRequest loaded (full debug)");
    }
}

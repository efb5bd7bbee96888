// Message sources: channel connectors that poll for new inbound messages
// and normalize them to `InboundMessage`.

pub mod gmail;
pub mod linkedin;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::InboundMessage;

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Short channel name for logging ("gmail", "linkedin").
    fn name(&self) -> &'static str;

    /// Fetch new messages since the last poll, normalized and oldest first.
    async fn poll(&self) -> Result<Vec<InboundMessage>>;

    /// Whether the source is reachable and authenticated.
    async fn is_available(&self) -> bool;
}

use tracing::{info, warn};

use crate::adapters::ChatHandle;
use crate::error::Result;
use crate::store::LinkStore;

/// Bring the chat bot's joined-channel set in line with the link store.
///
/// Runs once at startup, before either router starts accepting commands,
/// so viewer commands in already-linked channels are not missed during the
/// join window. After startup, the orchestrator keeps presence aligned by
/// joining and parting synchronously inside each link/unlink operation.
pub async fn synchronize(links: &LinkStore, chat: &dyn ChatHandle) -> Result<usize> {
    let channels = links.chat_channels().await?;
    let mut joined = 0;
    for channel in &channels {
        match chat.join(channel).await {
            Ok(()) => joined += 1,
            Err(err) => warn!(channel = %channel, error = %err, "Startup join failed"),
        }
    }
    info!(joined, total = channels.len(), "Chat presence synchronized");
    Ok(joined)
}

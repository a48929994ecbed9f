//! Re-establishing a dropped push channel.

use stylize_core::backoff::BackoffConfig;
use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIConnection};

/// Sleep, dial, repeat with growing delays. The first dial happens after
/// `initial_delay`. `None` means `cancel` fired.
pub async fn reconnect_loop(
    client: &ComfyUIClient,
    config: &BackoffConfig,
    cancel: &CancellationToken,
) -> Option<ComfyUIConnection> {
    let mut attempt = 0u32;

    for delay in config.delays() {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(client_id = %client.client_id(), "Reconnect cancelled");
                return None;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
        tracing::info!(
            client_id = %client.client_id(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to ComfyUI",
        );

        tokio::select! {
            _ = cancel.cancelled() => return None,
            result = client.connect() => match result {
                Ok(conn) => {
                    tracing::info!(client_id = %client.client_id(), attempt, "Reconnected to ComfyUI");
                    return Some(conn);
                }
                Err(e) => {
                    tracing::warn!(
                        client_id = %client.client_id(),
                        attempt,
                        error = %e,
                        "Reconnect failed",
                    );
                }
            },
        }
    }

    None
}

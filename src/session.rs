//! One WebSocket connection: inbound frames go to the hub, the connection's
//! outbound queue goes to the socket.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::config::Limits;
use crate::error::RelayError;
use crate::hub::HubHandle;
use crate::protocol::{self, ServerEvent};
use crate::registry::ConnectionId;

/// Drive an established WebSocket until either side goes away.
///
/// Registers with the hub first, so the first frame the client sees is
/// always `previousMessages`. Always unregisters on the way out.
pub async fn run<S>(ws: WebSocketStream<S>, hub: HubHandle, limits: Limits) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (id, outbound) = hub.open().await?;
    debug!(conn = %id, "session started");

    let result = pump(ws, id, outbound, &hub, &limits).await;

    // The hub may already be gone during shutdown.
    let _ = hub.disconnect(id).await;
    debug!(conn = %id, "session ended");
    result
}

async fn pump<S>(
    ws: WebSocketStream<S>,
    id: ConnectionId,
    mut outbound: mpsc::Receiver<Arc<ServerEvent>>,
    hub: &HubHandle,
    limits: &Limits,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => match protocol::decode(&text, limits) {
                        // Awaiting here stops reading this socket while the hub is backed up.
                        Ok(event) => hub.submit(id, event).await?,
                        Err(err) => hub.reject(id, err).await?,
                    },
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                    Some(Ok(WsMessage::Binary(_))) => {
                        debug!(conn = %id, "ignoring binary frame");
                    }
                    // Ping/pong are answered by tungstenite itself.
                    Some(Ok(_)) => {}
                    Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                }
            }

            event = outbound.recv() => {
                let Some(event) = event else {
                    // Hub dropped this connection.
                    let _ = sink.close().await;
                    return Ok(());
                };
                sink.send(WsMessage::Text(event.to_json()?)).await?;
            }
        }
    }
}

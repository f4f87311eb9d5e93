//! The seam between a controller and a running server.

use crate::dispatch::{Callback, Incoming, ListenerId, Pattern};
use crate::responses::Response;
use crate::WireError;
use async_trait::async_trait;
use rosc::OscPacket;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Packet transport to one server plus a listener registry for its replies.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, packet: OscPacket) -> Result<(), WireError>;

    fn register(
        &self,
        pattern: Pattern,
        once: bool,
        parse_response: bool,
        callback: Callback,
    ) -> ListenerId;

    fn unregister(&self, id: ListenerId) -> bool;

    /// Stop receiving and refuse further sends. Idempotent.
    async fn close(&self);
}

/// Send `packet` and wait for the first reply matching `reply`.
///
/// A `/fail` naming the same command short-circuits with
/// [`WireError::Failed`].
pub async fn request(
    transport: &dyn Transport,
    packet: OscPacket,
    reply: Pattern,
    timeout: Duration,
) -> Result<Response, WireError> {
    let (tx, rx) = oneshot::channel::<Result<Response, WireError>>();
    let slot = Arc::new(Mutex::new(Some(tx)));

    let command = match &packet {
        OscPacket::Message(message) => Some(message.addr.clone()),
        OscPacket::Bundle(_) => None,
    };

    let on_reply = Arc::clone(&slot);
    let reply_id = transport.register(
        reply.clone(),
        true,
        true,
        Arc::new(move |incoming| {
            if let Incoming::Parsed(response) = incoming {
                deliver(&on_reply, Ok(response));
            }
        }),
    );

    let fail_id = command.map(|command| {
        let on_fail = Arc::clone(&slot);
        transport.register(
            Pattern::new("/fail").with_arg(command),
            true,
            true,
            Arc::new(move |incoming| {
                if let Incoming::Parsed(Response::Fail { command, message }) = incoming {
                    deliver(&on_fail, Err(WireError::Failed { command, message }));
                }
            }),
        )
    });

    let cleanup = |transport: &dyn Transport| {
        transport.unregister(reply_id);
        if let Some(id) = fail_id {
            transport.unregister(id);
        }
    };

    if let Err(e) = transport.send(packet).await {
        cleanup(transport);
        return Err(e);
    }

    let outcome = tokio::time::timeout(timeout, rx).await;
    cleanup(transport);
    match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(WireError::Closed),
        Err(_) => Err(WireError::Timeout {
            after: timeout,
            waiting_for: reply.address,
        }),
    }
}

type ReplySlot = Mutex<Option<oneshot::Sender<Result<Response, WireError>>>>;

fn deliver(slot: &ReplySlot, value: Result<Response, WireError>) {
    let sender = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(sender) = sender {
        let _ = sender.send(value);
    }
}

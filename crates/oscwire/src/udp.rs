//! UDP transport to a real server.

use crate::dispatch::{Callback, Dispatcher, ListenerId, Pattern};
use crate::requests::flatten;
use crate::transport::Transport;
use crate::WireError;
use async_trait::async_trait;
use rosc::OscPacket;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RECV_BUFFER: usize = 65_507;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    closed: AtomicBool,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind an ephemeral local port and start receiving from `remote`.
    pub async fn connect(remote: SocketAddr) -> Result<Arc<Self>, WireError> {
        let bind: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        let dispatcher = Arc::new(Dispatcher::new());

        let receiver = tokio::spawn(receive_loop(
            Arc::clone(&socket),
            remote,
            Arc::clone(&dispatcher),
        ));

        info!(%remote, local = ?socket.local_addr().ok(), "udp transport connected");
        Ok(Arc::new(Self {
            socket,
            remote,
            dispatcher,
            closed: AtomicBool::new(false),
            receiver: Mutex::new(Some(receiver)),
        }))
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, remote: SocketAddr, dispatcher: Arc<Dispatcher>) {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "udp receive failed, stopping receiver");
                break;
            }
        };
        if from != remote {
            debug!(%from, "ignoring datagram from unexpected peer");
            continue;
        }
        match rosc::decoder::decode_udp(&buf[..len]) {
            Ok((_, packet)) => {
                for message in flatten(&packet) {
                    dispatcher.dispatch(message);
                }
            }
            Err(e) => warn!(error = ?e, "undecodable datagram"),
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, packet: OscPacket) -> Result<(), WireError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WireError::Closed);
        }
        let bytes = rosc::encoder::encode(&packet).map_err(WireError::codec)?;
        self.socket.send_to(&bytes, self.remote).await?;
        Ok(())
    }

    fn register(
        &self,
        pattern: Pattern,
        once: bool,
        parse_response: bool,
        callback: Callback,
    ) -> ListenerId {
        self.dispatcher
            .register(pattern, once, parse_response, callback)
    }

    fn unregister(&self, id: ListenerId) -> bool {
        self.dispatcher.unregister(id)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = receiver {
            handle.abort();
        }
        debug!(remote = %self.remote, "udp transport closed");
    }
}

/// Ask the OS for a UDP port that is free right now.
pub fn find_free_port() -> Result<u16, WireError> {
    let socket = std::net::UdpSocket::bind(("127.0.0.1", 0))?;
    Ok(socket.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests;
    use crate::transport::request;
    use rosc::{OscMessage, OscType};
    use std::time::Duration;

    #[tokio::test]
    async fn request_round_trips_through_a_fake_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let (_, packet) = rosc::decoder::decode_udp(&buf[..len]).unwrap();
            let id = match packet {
                OscPacket::Message(m) => m.args[0].clone(),
                OscPacket::Bundle(_) => panic!("expected message"),
            };
            let reply = OscPacket::Message(OscMessage {
                addr: "/synced".to_string(),
                args: vec![id],
            });
            let bytes = rosc::encoder::encode(&reply).unwrap();
            server.send_to(&bytes, from).await.unwrap();
        });

        let transport = UdpTransport::connect(server_addr).await.unwrap();
        let response = request(
            transport.as_ref(),
            OscPacket::Message(requests::sync(42)),
            Pattern::new("/synced").with_arg(OscType::Int(42)),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        assert_eq!(response, crate::Response::Synced(42));
        transport.close().await;
        assert!(matches!(
            transport.send(OscPacket::Message(requests::status())).await,
            Err(WireError::Closed)
        ));
    }

    #[test]
    fn free_port_is_nonzero() {
        assert_ne!(find_free_port().unwrap(), 0);
    }
}

//! TCP accept loop

use super::client::{ClientHandler, ClientSettings, SessionError};
use super::registry::ClientHandlerCollection;
use crate::core::serial::registry::SerialPortHandlerCollection;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accepts client connections and spawns a handler for each
pub struct ClientAcceptor {
    listener: TcpListener,
    links: Arc<SerialPortHandlerCollection>,
    sessions: Arc<ClientHandlerCollection>,
    settings: ClientSettings,
}

impl ClientAcceptor {
    /// Bind the listening socket
    pub async fn bind(
        addr: impl ToSocketAddrs,
        links: Arc<SerialPortHandlerCollection>,
        sessions: Arc<ClientHandlerCollection>,
        settings: ClientSettings,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            links,
            sessions,
            settings,
        })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        if let Ok(addr) = self.local_addr() {
            info!(%addr, "Accepting clients");
        }
        loop {
            let accepted = tokio::select! {
                () = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(%peer, %err, "Cannot disable Nagle");
                    }
                    let ticket = self.sessions.register(peer.to_string());
                    let client = ticket.id();
                    debug!(%client, %peer, "Client connected");
                    let handler =
                        ClientHandler::new(ticket, stream, self.links.clone(), self.settings.clone());
                    tokio::spawn(async move {
                        match handler.run().await {
                            Ok(()) => info!(%client, %peer, "Session closed"),
                            Err(SessionError::Wire(err)) => {
                                info!(%client, %peer, %err, "Session closed by client error")
                            }
                            Err(err) => warn!(%client, %peer, %err, "Session ended"),
                        }
                    });
                }
                Err(err) => {
                    warn!(%err, "Accept failed");
                }
            }
        }
        debug!("Accept loop stopped");
    }
}

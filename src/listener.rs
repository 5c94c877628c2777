//! Reverse listener: the child binds, the parent dials in, and the child
//! runs the TLS client side over the accepted socket.

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::files::TaggedFiles;
use crate::handshake::HandshakeSignals;
use crate::message::{read_events, Event, MessageHandler};
use crate::mux::MuxConnection;
use crate::session::Deadline;
use crate::tls::{server_name_for, Credential};
use crate::transfer::copy_files;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

pub struct ReverseListener {
    listener: TcpListener,
    tls: TlsConnector,
}

impl ReverseListener {
    pub async fn bind(addr: SocketAddr, credential: &Credential) -> Result<Self> {
        let tls = TlsConnector::from(Arc::new(credential.client_config()?));
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|e| Error::transport(format!("socket: {e}")))?;
        socket
            .set_reuseaddr(true)
            .map_err(|e| Error::transport(format!("reuse address: {e}")))?;
        socket
            .bind(addr)
            .map_err(|e| Error::transport(format!("bind {addr}: {e}")))?;
        let listener = socket
            .listen(16)
            .map_err(|e| Error::transport(format!("listen {addr}: {e}")))?;
        Ok(Self { listener, tls })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::transport(format!("local address: {e}")))
    }

    /// Accept one socket and complete the TLS handshake on it.
    ///
    /// The outer error is fatal (the listener itself failed); the inner one
    /// only concerns this peer.
    pub async fn accept(&self) -> Result<(SocketAddr, Result<MuxConnection>)> {
        let (tcp, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| Error::transport(format!("accept: {e}")))?;
        let _ = tcp.set_nodelay(true);
        let session = self
            .tls
            .connect(server_name_for(peer.ip()), tcp)
            .await
            .map(MuxConnection::new)
            .map_err(|e| Error::transport(format!("tls handshake with {peer}: {e}")));
        Ok((peer, session))
    }

    /// Service inbound connections one at a time until the listener fails
    /// or `deadline` passes. An expiring deadline is reported over the live
    /// connection before that connection is shut down.
    pub async fn serve(
        &self,
        files: &TaggedFiles,
        handler: &MessageHandler,
        signals: &HandshakeSignals,
        deadline: &Deadline,
    ) -> Error {
        loop {
            let accepted = tokio::select! {
                accepted = self.accept() => accepted,
                () = tokio::time::sleep_until(deadline.at()) => return deadline.expire(handler),
            };
            let (peer, session) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => return e,
            };
            match session {
                Ok(mut conn) => {
                    info!(parent: handler.span(), %peer, "parent connected");
                    let expired = tokio::select! {
                        () = handle_connection(&conn, files, handler, signals) => false,
                        () = tokio::time::sleep_until(deadline.at()) => true,
                    };
                    if expired {
                        let err = deadline.expire(handler);
                        handler.detach();
                        conn.shutdown().await;
                        return err;
                    }
                    info!(parent: handler.span(), %peer, "parent disconnected");
                }
                Err(e) => {
                    warn!(parent: handler.span(), %peer, error = %e, "rejected inbound connection");
                    handler.emit_error(&e);
                }
            }
        }
    }
}

/// Run one transfer pass and the control reader over `conn` until both end.
pub async fn handle_connection<C: Connection>(
    conn: &C,
    files: &TaggedFiles,
    handler: &MessageHandler,
    signals: &HandshakeSignals,
) {
    let control = match conn.open_control().await {
        Ok(control) => control,
        Err(e) => {
            handler.emit_error(&e);
            return;
        }
    };
    handler.attach(control.sink);

    let transfer = copy_files(conn, files, handler, |code| {
        if !signals.finish(code) {
            debug!(parent: handler.span(), code, "transfer result arrived after the cycle resolved");
        }
    });
    let reader = read_events(control.reader, |event| dispatch(event, signals, handler));
    let ((), read) = tokio::join!(transfer, reader);
    if let Err(e) = read {
        handler.emit_error(&e);
    }

    handler.detach();
}

fn dispatch(event: Event, signals: &HandshakeSignals, handler: &MessageHandler) {
    match event {
        Event::TerminateAck(exit_code) => {
            if !signals.acknowledge(exit_code) {
                debug!(parent: handler.span(), exit_code, "duplicate terminate_ack ignored");
            }
        }
        other => debug!(parent: handler.span(), ?other, "ignoring inbound event"),
    }
}

use log::{debug, trace};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

use super::dispatch::Dispatcher;
use super::proxy::{self, Relay};
use super::request::Request;

pub(crate) const BUFFER_SIZE: usize = 4096;

/// Serve one client connection.
///
/// The first chunk of data is the handshake. Invalid handshakes are closed
/// without a reply; valid ones go to whoever subscribed to them on the
/// dispatcher, or get proxied directly.
pub async fn process(stream: TcpStream, dispatcher: Arc<Dispatcher>, handshake_timeout: Duration) {
    let peer = stream.peer_addr().ok();

    let mut buf = [0u8; BUFFER_SIZE];
    let len = match tokio::time::timeout(handshake_timeout, read_some(&stream, &mut buf)).await {
        Ok(Ok(0)) => {
            trace!("Connection from {:?} closed before a request", peer);
            return;
        }
        Ok(Ok(len)) => len,
        Ok(Err(e)) => {
            debug!("Failed to read request from {:?}: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("No request from {:?} within {:?}", peer, handshake_timeout);
            return;
        }
    };

    let request = Request::with_timeout(&buf[..len], stream, handshake_timeout);

    if !request.is_valid() {
        trace!("Invalid SOCKS4 request from {:?} ({:?})", peer, &buf[..len]);
        request.close().await;
        return;
    }

    debug!(
        "SOCKS4 {} request from {:?}: {} (user {:?})",
        request.command().map_or("unknown", |c| c.name()),
        peer,
        request.target(),
        request.user_id()
    );

    let Some(request) = dispatcher.route(Arc::new(request)) else {
        trace!("Request from {:?} handed to subscribers", peer);
        return;
    };

    match proxy::proxy_request(&request, Relay::Direct).await {
        Ok(outcome) => debug!("Request from {:?} done: {:?}", peer, outcome),
        Err(e) => debug!("Request from {:?} failed: {}", peer, e),
    }
}

/// Wait for the first chunk of data. Zero means the peer closed.
async fn read_some(stream: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        stream.readable().await?;

        match stream.try_read(buf) {
            Ok(n) => return Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                continue;
            }
            Err(e) => {
                return Err(e);
            }
        }
    }
}

pub(crate) async fn write_all(stream: &TcpStream, buf: &[u8]) -> io::Result<()> {
    let mut offset = 0;
    while offset < buf.len() {
        stream.writable().await?;

        match stream.try_write(&buf[offset..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                offset += n;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                continue;
            }
            Err(e) => {
                return Err(e);
            }
        }
    }
    Ok(())
}

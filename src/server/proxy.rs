use log::{debug, trace};
use std::io;
use tokio::net::TcpStream;
use tokio::sync::watch;

use super::connection::{write_all, BUFFER_SIZE};
use super::request::Request;
use crate::error::{ProxyError, RequestError};
use crate::protocol::Command;

/// What happens to a CONNECT once the remote host is reached.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Relay {
    /// Pipe bytes between client and remote until either side closes.
    #[default]
    Direct,
    /// Hand both streams back to the caller, e.g. to inspect the traffic.
    Manual,
}

/// Bytes moved by a direct relay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Transferred {
    /// Client to remote.
    pub upstream: u64,
    /// Remote to client.
    pub downstream: u64,
}

#[derive(Debug)]
pub enum ProxyOutcome {
    Relayed(Transferred),
    Connected { client: TcpStream, remote: TcpStream },
    Rejected,
}

/// Carry out a valid request.
///
/// CONNECT dials the remote host, grants the request unless it was already
/// answered, then relays according to `relay`. A failed dial publishes
/// [`RequestError::Dial`] and rejects the request. BIND is rejected.
pub async fn proxy_request(request: &Request, relay: Relay) -> Result<ProxyOutcome, ProxyError> {
    if !request.is_valid() {
        return Err(ProxyError::InvalidRequest);
    }

    match request.command() {
        Some(Command::Connect) => connect(request, relay).await,
        Some(Command::Bind) => {
            debug!("BIND is not implemented, rejecting {}", request.target());
            request.reject(None).await?;
            Ok(ProxyOutcome::Rejected)
        }
        other => Err(ProxyError::UnexpectedCommand(other)),
    }
}

async fn connect(request: &Request, relay: Relay) -> Result<ProxyOutcome, ProxyError> {
    let remote = match TcpStream::connect((request.host(), request.port())).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("Failed to connect to destination {}: {}", request.target(), e);
            request.emit_error(RequestError::Dial {
                target: request.target(),
                message: e.to_string(),
            });
            if request.handshake_complete() {
                request.close().await;
            } else {
                request.reject(None).await?;
            }
            return Ok(ProxyOutcome::Rejected);
        }
    };

    if !request.handshake_complete() {
        request.accept().await?;
    }

    match relay {
        Relay::Manual => {
            let client = request.take_stream().await.ok_or(RequestError::Closed)?;
            Ok(ProxyOutcome::Connected { client, remote })
        }
        Relay::Direct => {
            let Some((client, teardown)) = request.start_relay().await else {
                request.finish();
                return Err(RequestError::Closed.into());
            };
            let transferred = pipe(request, client, remote, teardown).await;
            request.finish();
            Ok(ProxyOutcome::Relayed(transferred))
        }
    }
}

/// Relay until either side closes or the request is closed. Client-side
/// failures are published on the request; remote-side failures only end the
/// relay. Both streams are dropped on return.
async fn pipe(
    request: &Request,
    client: TcpStream,
    remote: TcpStream,
    mut teardown: watch::Receiver<bool>,
) -> Transferred {
    let mut transferred = Transferred::default();
    let mut buf = [0u8; BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = async { teardown.wait_for(|closed| *closed).await.map(|_| ()) } => {
                debug!("Request for {} closed, stopping relay", request.target());
                break;
            }
            ready = client.readable() => {
                if let Err(e) = ready {
                    request.emit_error(e.into());
                    break;
                }

                match client.try_read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = write_all(&remote, &buf[..n]).await {
                            trace!("Write to {} failed: {}", request.target(), e);
                            break;
                        }
                        transferred.upstream += n as u64;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        continue;
                    }
                    Err(e) => {
                        request.emit_error(e.into());
                        break;
                    }
                }
            }
            ready = remote.readable() => {
                if let Err(e) = ready {
                    trace!("Read from {} failed: {}", request.target(), e);
                    break;
                }

                match remote.try_read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = write_all(&client, &buf[..n]).await {
                            request.emit_error(e.into());
                            break;
                        }
                        transferred.downstream += n as u64;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        continue;
                    }
                    Err(e) => {
                        trace!("Read from {} failed: {}", request.target(), e);
                        break;
                    }
                }
            }
        }
    }

    debug!("Connection to {} closed ({:?})", request.target(), transferred);
    transferred
}

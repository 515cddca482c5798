use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use log::{debug, trace};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::connection::write_all;
use crate::error::RequestError;
use crate::protocol::{self, Command, ParsedRequest, Status, PROTOCOL_VERSION};

/// Recommended ceiling for both CONNECT and BIND handshakes.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestEvent {
    Error(RequestError),
    /// The client connection is gone. Nothing is published afterwards.
    End,
}

/// Pending -> Completed, once.
#[derive(Debug, Default)]
struct HandshakeLatch(AtomicBool);

impl HandshakeLatch {
    /// False when the handshake had already completed.
    fn complete(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_complete(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// State reachable from both the request handles and the watchdog task.
struct Shared {
    stream: Mutex<Option<TcpStream>>,
    handshake: HandshakeLatch,
    events: StdMutex<Option<broadcast::Sender<RequestEvent>>>,
    /// Flips to `true` when the connection is closed. A running relay
    /// stops on it.
    teardown: watch::Sender<bool>,
    /// The stream has been handed to a relay, which publishes `End` once
    /// it is done with it.
    relaying: AtomicBool,
}

impl Shared {
    fn emit(&self, event: RequestEvent) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = events.as_ref() {
            // nobody listening is fine
            let _ = tx.send(event);
        }
    }

    /// Publish `End` and detach all subscribers.
    fn finish(&self) {
        let tx = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(RequestEvent::End);
        }
    }

    async fn close(&self) {
        let stream = self.stream.lock().await.take();
        if let Some(mut stream) = stream {
            let _ = stream.shutdown().await;
        }
        self.teardown.send_replace(true);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.finish();
    }
}

/// One client's SOCKS4 request and the connection it arrived on.
///
/// The reply to a request is sent exactly once, through either
/// [`accept`](Request::accept) or [`reject`](Request::reject). Calling either
/// one after the handshake completed sends nothing: the connection is closed
/// and a [`RequestError::HandshakeComplete`] is published from a separate
/// task.
///
/// While a valid request is pending, a watchdog task owns the connection:
/// it publishes [`RequestEvent::End`] (preceded by an error, if any) when the
/// client goes away, and closes the connection once the handshake timeout
/// passes without an answer.
pub struct Request {
    parsed: ParsedRequest,
    peer: Option<SocketAddr>,
    shared: Arc<Shared>,
    watchdog: Option<JoinHandle<()>>,
}

impl Request {
    /// Must be called from within a tokio runtime.
    pub fn build(buf: &[u8], stream: TcpStream) -> Self {
        Self::with_timeout(buf, stream, HANDSHAKE_TIMEOUT)
    }

    /// Like [`build`](Request::build) with a custom handshake timeout.
    ///
    /// An invalid request leaves the connection open; closing it is up to
    /// the caller.
    pub fn with_timeout(buf: &[u8], stream: TcpStream, timeout: Duration) -> Self {
        let parsed = protocol::parse(buf);
        let peer = stream.peer_addr().ok();

        let events = parsed
            .valid
            .then(|| broadcast::channel(EVENT_CAPACITY).0);

        let shared = Arc::new(Shared {
            stream: Mutex::new(Some(stream)),
            handshake: HandshakeLatch::default(),
            events: StdMutex::new(events),
            teardown: watch::channel(false).0,
            relaying: AtomicBool::new(false),
        });

        let watchdog = parsed
            .valid
            .then(|| tokio::spawn(watch_pending(Arc::clone(&shared), timeout)));

        Request {
            parsed,
            peer,
            shared,
            watchdog,
        }
    }

    pub fn version(&self) -> u8 {
        self.parsed.version
    }

    pub fn command(&self) -> Option<Command> {
        self.parsed.command
    }

    pub fn port(&self) -> u16 {
        self.parsed.port
    }

    pub fn host(&self) -> &str {
        &self.parsed.host
    }

    pub fn user_id(&self) -> &str {
        &self.parsed.user_id
    }

    pub fn is_valid(&self) -> bool {
        self.parsed.valid
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// `host:port` as requested by the client.
    pub fn target(&self) -> String {
        format!("{}:{}", self.parsed.host, self.parsed.port)
    }

    pub fn handshake_complete(&self) -> bool {
        self.shared.handshake.is_complete()
    }

    /// Listen for errors and the end of the connection.
    ///
    /// `None` for invalid requests and once the request has ended.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<RequestEvent>> {
        self.shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe)
    }

    /// Grant the request. The client then expects data from the remote host.
    ///
    /// Only CONNECT can be granted; accepting a BIND closes the connection
    /// and publishes [`RequestError::BindUnsupported`].
    ///
    /// Returns an error only when the reply could not be written.
    pub async fn accept(&self) -> Result<(), RequestError> {
        if !self.complete_handshake() {
            self.misuse("accept");
            return Ok(());
        }

        if self.parsed.version != PROTOCOL_VERSION {
            return Ok(());
        }

        match self.parsed.command {
            Some(Command::Connect) => {
                trace!("Granting request from {:?} to {}", self.peer, self.target());
                self.send(&protocol::reply(Status::Granted)).await
            }
            _ => {
                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move {
                    shared.close().await;
                    shared.emit(RequestEvent::Error(RequestError::BindUnsupported));
                    shared.finish();
                });
                Ok(())
            }
        }
    }

    /// Reject the request with `reason` ([`Status::Rejected`] when `None`)
    /// and close the connection once the reply is out.
    pub async fn reject(&self, reason: Option<Status>) -> Result<(), RequestError> {
        if !self.complete_handshake() {
            self.misuse("reject");
            return Ok(());
        }

        let status = reason.unwrap_or_default();
        let result = if self.parsed.version == PROTOCOL_VERSION {
            trace!("Rejecting request from {:?} with {:?}", self.peer, status);
            self.send(&protocol::reply(status)).await
        } else {
            Ok(())
        };

        self.close().await;
        result
    }

    /// Take the client connection out of the request, e.g. to relay it.
    ///
    /// The caller owns the connection from here on: it is no longer watched
    /// or timed out, and a later [`close`](Request::close) cannot reach it.
    pub async fn take_stream(&self) -> Option<TcpStream> {
        self.stop_watchdog();
        self.shared.stream.lock().await.take()
    }

    /// Shut the client connection down and end the request. A relay started
    /// by [`proxy_request`](super::proxy::proxy_request) stops too.
    pub async fn close(&self) {
        self.stop_watchdog();
        self.shared.close().await;
        self.shared.finish();
    }

    /// Hand the client connection to a relay. The receiver turns `true`
    /// when the request is closed while the relay runs; the relay then
    /// drops the connection and calls [`finish`](Request::finish).
    pub(crate) async fn start_relay(&self) -> Option<(TcpStream, watch::Receiver<bool>)> {
        let teardown = self.shared.teardown.subscribe();
        self.shared.relaying.store(true, Ordering::Release);
        let stream = self.take_stream().await?;
        Some((stream, teardown))
    }

    pub(crate) fn emit_error(&self, err: RequestError) {
        self.shared.emit(RequestEvent::Error(err));
    }

    /// End the request without touching the connection.
    pub(crate) fn finish(&self) {
        self.shared.finish();
    }

    fn complete_handshake(&self) -> bool {
        if !self.shared.handshake.complete() {
            return false;
        }
        self.stop_watchdog();
        true
    }

    /// The watchdog holds the stream lock while it waits on the client.
    /// Aborting it releases the lock.
    fn stop_watchdog(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.abort();
        }
    }

    /// Misuse never fails the call that detected it; the connection is
    /// closed and the error published from another task.
    fn misuse(&self, action: &'static str) {
        debug!("Cannot {action} request from {:?}: handshake complete", self.peer);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            // published before the relay can see the teardown and end
            shared.emit(RequestEvent::Error(RequestError::HandshakeComplete {
                action,
            }));
            shared.close().await;
            if !shared.relaying.load(Ordering::Acquire) {
                shared.finish();
            }
        });
    }

    async fn send(&self, reply: &[u8]) -> Result<(), RequestError> {
        let stream = self.shared.stream.lock().await;
        let result = match stream.as_ref() {
            Some(stream) => write_all(stream, reply).await.map_err(RequestError::from),
            None => Err(RequestError::Closed),
        };
        if let Err(e) = &result {
            self.emit_error(e.clone());
        }
        result
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.stop_watchdog();
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("parsed", &self.parsed)
            .field("peer", &self.peer)
            .field("handshake_complete", &self.handshake_complete())
            .finish()
    }
}

/// What the watchdog saw on a pending connection.
enum Pending {
    Closed,
    Failed(io::Error),
    /// The client sent more bytes. They belong to whoever answers the
    /// request, so only the deadline is left to watch.
    Data,
    TimedOut,
}

/// Watch a pending request until its deadline. Aborted as soon as the
/// handshake completes or the stream is taken.
async fn watch_pending(shared: Arc<Shared>, timeout: Duration) {
    let deadline = Instant::now() + timeout;

    let seen = {
        let stream = shared.stream.lock().await;
        let Some(stream) = stream.as_ref() else {
            return;
        };
        let mut byte = [0u8; 1];
        tokio::select! {
            peeked = stream.peek(&mut byte) => match peeked {
                Ok(0) => Pending::Closed,
                Ok(_) => Pending::Data,
                Err(e) => Pending::Failed(e),
            },
            _ = tokio::time::sleep_until(deadline) => Pending::TimedOut,
        }
    };

    match seen {
        Pending::Closed => {
            debug!("Client closed the connection before the handshake completed");
        }
        Pending::Failed(e) => {
            debug!("Client connection failed before the handshake completed: {}", e);
            shared.emit(RequestEvent::Error(e.into()));
        }
        Pending::Data | Pending::TimedOut => {
            tokio::time::sleep_until(deadline).await;
            if shared.handshake.is_complete() {
                return;
            }
            debug!("Handshake not completed within {:?}, closing connection", timeout);
        }
    }

    shared.close().await;
    shared.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::{read_to_end, socket_pair};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const CONNECT: [u8; 9] = [4, 1, 0x00, 0x50, 127, 0, 0, 1, 0];
    const BIND: [u8; 9] = [4, 2, 0x00, 0x50, 127, 0, 0, 1, 0];

    #[tokio::test]
    async fn test_build_valid_request() {
        let (_client, server) = socket_pair().await;
        let mut buf = vec![4, 1, 0x01, 0xBB, 0, 0, 0, 1];
        buf.extend_from_slice(b"carol\0example.com\0");
        let request = Request::build(&buf, server);

        assert!(request.is_valid());
        assert_eq!(request.version(), 4);
        assert_eq!(request.command(), Some(Command::Connect));
        assert_eq!(request.port(), 443);
        assert_eq!(request.host(), "example.com");
        assert_eq!(request.user_id(), "carol");
        assert_eq!(request.target(), "example.com:443");
        assert!(request.peer_addr().is_some());
        assert!(!request.handshake_complete());
        assert!(request.subscribe().is_some());
    }

    #[tokio::test]
    async fn test_unsupported_version_leaves_connection_open() {
        let (mut client, server) = socket_pair().await;
        let request = Request::build(&[5, 1, 0, 0x50, 127, 0, 0, 1, 0], server);

        assert!(!request.is_valid());
        assert!(request.subscribe().is_none());

        client.write_all(b"still here").await.unwrap();
        let mut stream = request.take_stream().await.unwrap();
        let mut buf = [0u8; 10];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");
    }

    #[tokio::test]
    async fn test_accept_connect_sends_grant() {
        let (mut client, server) = socket_pair().await;
        let request = Request::build(&CONNECT, server);

        request.accept().await.unwrap();
        assert!(request.handshake_complete());

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0, 0x5a, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_reject_default_status_then_close() {
        let (mut client, server) = socket_pair().await;
        let request = Request::build(&CONNECT, server);
        let mut events = request.subscribe().unwrap();

        request.reject(None).await.unwrap();

        assert_eq!(read_to_end(&mut client).await, vec![0, 0x5b, 0, 0, 0, 0, 0, 0]);
        assert_eq!(events.recv().await.unwrap(), RequestEvent::End);
        assert!(events.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_reject_with_reason() {
        let (mut client, server) = socket_pair().await;
        let request = Request::build(&CONNECT, server);

        request
            .reject(Some(Status::RejectedUserIdMismatch))
            .await
            .unwrap();

        assert_eq!(read_to_end(&mut client).await, vec![0, 0x5d, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_second_accept_is_usage_error() {
        let (mut client, server) = socket_pair().await;
        let request = Request::build(&CONNECT, server);
        let mut events = request.subscribe().unwrap();

        request.accept().await.unwrap();
        request.accept().await.unwrap();

        // one reply, then the connection goes away
        assert_eq!(read_to_end(&mut client).await, vec![0, 0x5a, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            events.recv().await.unwrap(),
            RequestEvent::Error(RequestError::HandshakeComplete { action: "accept" })
        );
        assert_eq!(events.recv().await.unwrap(), RequestEvent::End);
        assert!(events.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_reject_after_accept_is_usage_error() {
        let (mut client, server) = socket_pair().await;
        let request = Request::build(&CONNECT, server);
        let mut events = request.subscribe().unwrap();

        request.accept().await.unwrap();
        request.reject(None).await.unwrap();

        assert_eq!(read_to_end(&mut client).await, vec![0, 0x5a, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            events.recv().await.unwrap(),
            RequestEvent::Error(RequestError::HandshakeComplete { action: "reject" })
        );
        assert_eq!(events.recv().await.unwrap(), RequestEvent::End);
    }

    #[tokio::test]
    async fn test_accept_after_reject_sends_nothing() {
        let (mut client, server) = socket_pair().await;
        let request = Request::build(&CONNECT, server);

        request.reject(None).await.unwrap();
        request.accept().await.unwrap();

        assert_eq!(read_to_end(&mut client).await, vec![0, 0x5b, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_accept_bind_closes_with_error() {
        let (mut client, server) = socket_pair().await;
        let request = Request::build(&BIND, server);
        let mut events = request.subscribe().unwrap();

        request.accept().await.unwrap();

        assert!(read_to_end(&mut client).await.is_empty());
        assert_eq!(
            events.recv().await.unwrap(),
            RequestEvent::Error(RequestError::BindUnsupported)
        );
        assert_eq!(events.recv().await.unwrap(), RequestEvent::End);
    }

    #[tokio::test]
    async fn test_pending_request_times_out() {
        let (mut client, server) = socket_pair().await;
        let timeout = Duration::from_millis(200);
        let started = tokio::time::Instant::now();
        let request = Request::with_timeout(&CONNECT, server, timeout);
        let mut events = request.subscribe().unwrap();

        assert!(read_to_end(&mut client).await.is_empty());
        assert!(started.elapsed() >= timeout);
        assert_eq!(events.recv().await.unwrap(), RequestEvent::End);

        // too late to answer
        assert_eq!(request.accept().await, Err(RequestError::Closed));
    }

    #[tokio::test]
    async fn test_completed_request_does_not_time_out() {
        let (mut client, server) = socket_pair().await;
        let request = Request::with_timeout(&CONNECT, server, Duration::from_millis(50));

        request.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        let mut stream = request.take_stream().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_client_close_while_pending_ends_request() {
        let (client, server) = socket_pair().await;
        let request = Request::build(&CONNECT, server);
        let mut events = request.subscribe().unwrap();

        drop(client);

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv()).await;
        assert_eq!(event.unwrap().unwrap(), RequestEvent::End);
        assert!(events.recv().await.is_err());
        assert!(request.subscribe().is_none());
        assert_eq!(request.accept().await, Err(RequestError::Closed));
    }

    #[tokio::test]
    async fn test_pending_client_data_is_left_alone() {
        let (mut client, server) = socket_pair().await;
        let request = Request::build(&CONNECT, server);
        let mut events = request.subscribe().unwrap();

        client.write_all(b"early").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());

        request.accept().await.unwrap();
        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x5a);

        let mut stream = request.take_stream().await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");
    }

    #[tokio::test]
    async fn test_take_stream_while_pending() {
        let (mut client, server) = socket_pair().await;
        let request = Request::with_timeout(&CONNECT, server, Duration::from_millis(50));

        let stream = tokio::time::timeout(Duration::from_secs(2), request.take_stream())
            .await
            .unwrap();
        let mut stream = stream.unwrap();

        // taken streams are not timed out
        tokio::time::sleep(Duration::from_millis(150)).await;
        client.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[test]
    fn test_default_handshake_timeout() {
        assert_eq!(HANDSHAKE_TIMEOUT, Duration::from_secs(120));
    }
}

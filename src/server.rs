use log::{trace, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::config::Config;

mod connection;
pub mod dispatch;
pub mod proxy;
pub mod request;

pub use connection::process;
use dispatch::{Dispatcher, Interest, Requests};
use request::HANDSHAKE_TIMEOUT;

pub struct SOCKS4Server {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    handshake_timeout: Duration,
}

impl SOCKS4Server {
    pub async fn bind(address: &str, port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((address, port)).await?;
        Ok(Self::from_listener(listener))
    }

    pub async fn from_config(config: &Config) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        Ok(Self::from_listener(listener).with_handshake_timeout(config.handshake_timeout()))
    }

    pub fn from_listener(listener: TcpListener) -> Self {
        SOCKS4Server {
            listener,
            dispatcher: Arc::new(Dispatcher::new()),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Take over requests matching `interest` instead of proxying them.
    pub fn subscribe(&self, interest: Interest) -> Requests {
        self.dispatcher.subscribe(interest)
    }

    pub async fn run(&self) {
        loop {
            let (socket, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            trace!("Accepted connection from {}", peer);

            let dispatcher = Arc::clone(&self.dispatcher);
            let handshake_timeout = self.handshake_timeout;
            tokio::spawn(async move {
                process(socket, dispatcher, handshake_timeout).await;
            });
        }
    }
}

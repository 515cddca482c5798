//! Decides who handles a valid request.
//!
//! Application code subscribes to requests either for one command or for
//! all of them. Every generic subscriber gets a request first, then every
//! subscriber for its command, and they own it from there. When no
//! subscriber took it, the request comes back to the caller to be proxied.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use super::request::Request;
use crate::protocol::Command;

pub type Requests = mpsc::UnboundedReceiver<Arc<Request>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Any,
    Command(Command),
}

impl Interest {
    fn matches(&self, command: Option<Command>) -> bool {
        match self {
            Interest::Any => true,
            Interest::Command(c) => command == Some(*c),
        }
    }
}

#[derive(Debug, Default)]
pub struct Dispatcher {
    listeners: Mutex<Vec<(Interest, mpsc::UnboundedSender<Arc<Request>>)>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests matching `interest` are delivered to the returned receiver
    /// until it is dropped.
    pub fn subscribe(&self, interest: Interest) -> Requests {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((interest, tx));
        rx
    }

    /// Deliver `request` to its subscribers, or hand it back when none of
    /// them received it. Dropped subscribers are forgotten.
    pub fn route(&self, request: Arc<Request>) -> Option<Arc<Request>> {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);

        let command = request.command();
        let generic = listeners
            .iter()
            .filter(|(interest, _)| *interest == Interest::Any);
        let specific = listeners
            .iter()
            .filter(|(interest, _)| *interest != Interest::Any && interest.matches(command));

        let delivered = generic
            .chain(specific)
            .filter(|(_, tx)| tx.send(Arc::clone(&request)).is_ok())
            .count();

        listeners.retain(|(_, tx)| !tx.is_closed());
        (delivered == 0).then_some(request)
    }
}

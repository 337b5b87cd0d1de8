use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use crate::message::{Listen, TransportError, ERROR_PAYLOAD};

/// Request/response primitive between the engine and the interception layer.
///
/// `listen` is bounded by its timeout and reports timeouts and broken
/// links as [`Listen`] values, never as errors.
pub trait Transport {
    /// Send one payload to the interception layer.
    fn send(&mut self, payload: &str) -> Result<(), TransportError>;

    /// Wait for the next payload. `None` waits indefinitely.
    fn listen(&mut self, timeout: Option<Duration>) -> Listen;

    /// Drop any stale payloads in either direction.
    fn clear(&mut self);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, payload: &str) -> Result<(), TransportError> {
        (**self).send(payload)
    }

    fn listen(&mut self, timeout: Option<Duration>) -> Listen {
        (**self).listen(timeout)
    }

    fn clear(&mut self) {
        (**self).clear()
    }
}

/// Engine-side endpoint of an in-process channel link.
///
/// Built by [`crate::hub::InterceptionHub::start`] or [`channel_pair`].
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    outbound: Sender<String>,
    /// Clone of the far side's receiver, used only to drain stale decisions.
    outbound_drain: Receiver<String>,
    inbound: Receiver<String>,
}

impl ChannelTransport {
    pub(crate) fn new(
        outbound: Sender<String>,
        outbound_drain: Receiver<String>,
        inbound: Receiver<String>,
    ) -> Self {
        Self {
            outbound,
            outbound_drain,
            inbound,
        }
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, payload: &str) -> Result<(), TransportError> {
        self.outbound
            .send(payload.to_string())
            .map_err(|_| TransportError::Disconnected)
    }

    fn listen(&mut self, timeout: Option<Duration>) -> Listen {
        let received = match timeout {
            Some(timeout) => self.inbound.recv_timeout(timeout),
            None => self
                .inbound
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(payload) if payload == ERROR_PAYLOAD => Listen::Error,
            Ok(payload) => Listen::Payload(payload),
            Err(RecvTimeoutError::Timeout) => Listen::Timeout,
            Err(RecvTimeoutError::Disconnected) => Listen::Error,
        }
    }

    fn clear(&mut self) {
        while self.inbound.try_recv().is_ok() {}
        while self.outbound_drain.try_recv().is_ok() {}
    }
}

/// The far side of a [`channel_pair`]: receives what the engine sends and
/// feeds payloads back to it.
#[derive(Debug, Clone)]
pub struct ChannelPeer {
    pub from_engine: Receiver<String>,
    pub to_engine: Sender<String>,
}

/// An unbounded engine/peer link.
pub fn channel_pair() -> (ChannelTransport, ChannelPeer) {
    let (to_peer, from_engine) = crossbeam::channel::unbounded();
    let (to_engine, inbound) = crossbeam::channel::unbounded();
    (
        ChannelTransport::new(to_peer, from_engine.clone(), inbound),
        ChannelPeer {
            from_engine,
            to_engine,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_times_out() {
        let (mut transport, _peer) = channel_pair();
        assert_eq!(
            transport.listen(Some(Duration::from_millis(10))),
            Listen::Timeout
        );
    }

    #[test]
    fn test_error_payload_maps_to_error() {
        let (mut transport, peer) = channel_pair();
        peer.to_engine.send(ERROR_PAYLOAD.to_string()).unwrap();
        assert_eq!(transport.listen(None), Listen::Error);
    }

    #[test]
    fn test_disconnected_peer_is_error() {
        let (mut transport, peer) = channel_pair();
        drop(peer);
        assert_eq!(
            transport.listen(Some(Duration::from_millis(10))),
            Listen::Error
        );
    }

    #[test]
    fn test_clear_drains_both_directions() {
        let (mut transport, peer) = channel_pair();
        transport.send("stale decision").unwrap();
        peer.to_engine.send("stale event".into()).unwrap();
        transport.clear();
        assert!(peer.from_engine.try_recv().is_err());
        assert_eq!(
            transport.listen(Some(Duration::from_millis(5))),
            Listen::Timeout
        );
    }
}

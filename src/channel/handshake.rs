//! Handshake and keepalive state machine (§4.5): a channel moves from
//! `Handshaking` to `Active` once both sides have exchanged `HELLO`/`STATUS`,
//! then `Keepalive::on_tick` drives `PING`/`TIMEOUT` off `last_recv`.

use std::time::{Duration, Instant};

use log::debug;

use crate::identity::Node;

use super::error::{ChannelError, ChannelResult};
use super::messages::{Disconnect, DisconnectReason, Hello, Status, TransportMessage};

pub const DEFAULT_IDLE_READ: Duration = Duration::from_secs(20);
pub const DEFAULT_IDLE_CLOSE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Handshaking,
    Active,
}

/// Drives one channel's handshake against a fixed local identity. Holds no
/// I/O itself; `Connection` feeds it inbound messages and sends whatever
/// `HandshakeDriver` tells it to. Tracked as four independent flags rather
/// than a linear state list because `HELLO` and `STATUS` can arrive in
/// either order relative to when the local side sends its own.
pub struct HandshakeDriver {
    local_hello: Hello,
    local_status: Status,
    hello_sent: bool,
    hello_received: bool,
    status_sent: bool,
    status_received: bool,
    pub peer_descriptor: Option<Node>,
}

pub enum HandshakeOutcome {
    /// Send these messages (in order) and keep waiting.
    Send(Vec<TransportMessage>),
    /// Handshake complete; channel may be promoted to active.
    Done,
    /// Handshake failed; close with the given reason.
    Reject(DisconnectReason),
}

impl HandshakeDriver {
    fn new(local_hello: Hello, local_status: Status) -> Self {
        Self {
            local_hello,
            local_status,
            hello_sent: false,
            hello_received: false,
            status_sent: false,
            status_received: false,
            peer_descriptor: None,
        }
    }

    pub fn new_outbound(local_hello: Hello, local_status: Status) -> Self {
        Self::new(local_hello, local_status)
    }

    pub fn new_inbound(local_hello: Hello, local_status: Status) -> Self {
        Self::new(local_hello, local_status)
    }

    pub fn state(&self) -> HandshakeState {
        if self.hello_sent && self.hello_received && self.status_sent && self.status_received {
            HandshakeState::Active
        } else {
            HandshakeState::Handshaking
        }
    }

    /// Initial message the outbound (dialing) side sends before anything
    /// arrives from the peer. Inbound channels wait for the peer's `HELLO`.
    pub fn initial_send(&mut self) -> Option<TransportMessage> {
        if self.hello_sent {
            return None;
        }
        self.hello_sent = true;
        Some(TransportMessage::Hello(self.local_hello.clone()))
    }

    /// Feed one inbound message while `state() != Active`.
    pub fn on_message(&mut self, message: TransportMessage) -> ChannelResult<HandshakeOutcome> {
        match message {
            TransportMessage::Hello(hello) => {
                if !self.compatible(&hello) {
                    return Ok(HandshakeOutcome::Reject(DisconnectReason::Incompatible));
                }
                if self.hello_received {
                    return Ok(HandshakeOutcome::Reject(DisconnectReason::BadProtocol));
                }
                self.peer_descriptor = Some(hello.peer_descriptor);
                self.hello_received = true;

                let mut sends = Vec::new();
                if !self.hello_sent {
                    self.hello_sent = true;
                    sends.push(TransportMessage::Hello(self.local_hello.clone()));
                }
                if !self.status_sent {
                    self.status_sent = true;
                    sends.push(TransportMessage::Status(self.local_status.clone()));
                }
                if self.state() == HandshakeState::Active {
                    Ok(HandshakeOutcome::Done)
                } else {
                    Ok(HandshakeOutcome::Send(sends))
                }
            }
            TransportMessage::Status(_peer_status) => {
                if !self.hello_received || self.status_received {
                    return Ok(HandshakeOutcome::Reject(DisconnectReason::BadProtocol));
                }
                self.status_received = true;
                if self.state() == HandshakeState::Active {
                    Ok(HandshakeOutcome::Done)
                } else {
                    Ok(HandshakeOutcome::Send(Vec::new()))
                }
            }
            TransportMessage::Disconnect(Disconnect { reason }) => Ok(HandshakeOutcome::Reject(reason)),
            other => {
                debug!("unexpected message code {} during handshake", other.code());
                Ok(HandshakeOutcome::Reject(DisconnectReason::BadProtocol))
            }
        }
    }

    fn compatible(&self, hello: &Hello) -> bool {
        hello.network_id == self.local_hello.network_id
            && hello.network_version == self.local_hello.network_version
    }
}

/// Tracks `last_send`/`last_recv` and decides whether a `PING` or a
/// `TIMEOUT` close is due (§4.5).
pub struct Keepalive {
    idle_read: Duration,
    idle_close: Duration,
    last_recv: Instant,
}

pub enum KeepaliveAction {
    None,
    SendPing,
    Timeout,
}

impl Keepalive {
    pub fn new(idle_read: Duration, idle_close: Duration) -> Self {
        Self {
            idle_read,
            idle_close,
            last_recv: Instant::now(),
        }
    }

    pub fn on_recv(&mut self) {
        self.last_recv = Instant::now();
    }

    pub fn on_tick(&self, now: Instant) -> KeepaliveAction {
        let idle = now.saturating_duration_since(self.last_recv);
        if idle > self.idle_close {
            KeepaliveAction::Timeout
        } else if idle > self.idle_read {
            KeepaliveAction::SendPing
        } else {
            KeepaliveAction::None
        }
    }
}

impl Default for Keepalive {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_READ, DEFAULT_IDLE_CLOSE)
    }
}

/// `PING` always elicits an immediate `PONG`; `PONG` is silently consumed.
/// Returns the reply to send, if any.
pub fn handle_keepalive_message(message: &TransportMessage) -> Option<TransportMessage> {
    match message {
        TransportMessage::Ping => Some(TransportMessage::Pong),
        TransportMessage::Pong => None,
        _ => None,
    }
}

/// `timeout_to_error` adapts a `KeepaliveAction::Timeout` into the channel
/// error the read loop propagates (§7: `Timeout` closes and increments the
/// peer's failure counter).
pub fn timeout_to_error() -> ChannelError {
    ChannelError::Timeout
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;
    use std::net::Ipv4Addr;

    fn hello(network_id: u8, network_version: i16) -> Hello {
        Hello {
            network_id,
            network_version,
            peer_descriptor: Node::new(
                Some(NodeId::new([1u8; 20])),
                Some(Ipv4Addr::new(127, 0, 0, 1)),
                None,
                30303,
                network_id,
                network_version,
            )
            .unwrap(),
        }
    }

    #[test]
    fn outbound_sends_hello_first() {
        let mut driver = HandshakeDriver::new_outbound(hello(1, 1), Status { app_data: vec![] });
        let first = driver.initial_send().unwrap();
        assert!(matches!(first, TransportMessage::Hello(_)));
        assert!(driver.initial_send().is_none());
        assert_eq!(driver.state(), HandshakeState::Handshaking);
    }

    #[test]
    fn full_handshake_reaches_active_both_sides() {
        let mut outbound = HandshakeDriver::new_outbound(hello(1, 1), Status { app_data: vec![] });
        let mut inbound = HandshakeDriver::new_inbound(hello(1, 1), Status { app_data: vec![] });

        let outbound_hello = outbound.initial_send().unwrap();

        // Inbound receives the initiator's HELLO, replies with its own HELLO + STATUS.
        let outcome = inbound.on_message(outbound_hello).unwrap();
        let inbound_sends = match outcome {
            HandshakeOutcome::Send(sends) => sends,
            _ => panic!("expected Send"),
        };
        assert_eq!(inbound_sends.len(), 2);

        // Outbound feeds both back and should complete.
        let mut done = false;
        for message in inbound_sends {
            match outbound.on_message(message).unwrap() {
                HandshakeOutcome::Done => done = true,
                HandshakeOutcome::Send(sends) => {
                    for s in sends {
                        assert!(matches!(inbound.on_message(s).unwrap(), HandshakeOutcome::Done | HandshakeOutcome::Send(_)));
                    }
                }
                HandshakeOutcome::Reject(reason) => panic!("unexpected reject: {reason:?}"),
            }
        }
        assert!(done);
        assert_eq!(outbound.state(), HandshakeState::Active);
    }

    #[test]
    fn incompatible_network_is_rejected() {
        let mut inbound = HandshakeDriver::new_inbound(hello(1, 1), Status { app_data: vec![] });
        let outcome = inbound.on_message(TransportMessage::Hello(hello(2, 1))).unwrap();
        assert!(matches!(
            outcome,
            HandshakeOutcome::Reject(DisconnectReason::Incompatible)
        ));
    }

    #[test]
    fn keepalive_escalates_from_ping_to_timeout() {
        let keepalive = Keepalive::new(Duration::from_secs(10), Duration::from_secs(20));
        let start = Instant::now();
        assert!(matches!(keepalive.on_tick(start), KeepaliveAction::None));
        assert!(matches!(
            keepalive.on_tick(start + Duration::from_secs(15)),
            KeepaliveAction::SendPing
        ));
        assert!(matches!(
            keepalive.on_tick(start + Duration::from_secs(25)),
            KeepaliveAction::Timeout
        ));
    }

    #[test]
    fn ping_always_elicits_pong() {
        assert!(matches!(
            handle_keepalive_message(&TransportMessage::Ping),
            Some(TransportMessage::Pong)
        ));
        assert!(handle_keepalive_message(&TransportMessage::Pong).is_none());
    }
}

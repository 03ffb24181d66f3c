//! Control-plane handler
//!
//! Service packets arrive inside the encrypted channel and are dispatched
//! here after decryption. The handler answers what it can (ping, rekey)
//! and swallows the rest; anything recognized as a service packet is
//! "handled" so control traffic never reaches the TUN device.

use std::time::Instant;

use crate::error::SessionError;
use crate::protocol::service::{self, ServicePacket};
use crate::session::peer::Peer;

/// Verdict of [`ControlHandler::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Not a service packet; forward to the TUN device.
    NotControl,
    /// Consumed (replied to or swallowed); do not forward.
    Handled,
}

/// Parses and answers in-band service packets.
#[derive(Default)]
pub struct ControlHandler;

impl ControlHandler {
    pub fn new() -> Self {
        Self
    }

    /// Dispatch one decrypted payload. The only error that escapes is
    /// `EpochExhausted`, and the packet still counts as handled; the
    /// ingress loop just gets to see the condition.
    pub async fn handle(
        &self,
        plain: &[u8],
        peer: &Peer,
    ) -> Result<ControlOutcome, SessionError> {
        if !service::is_service(plain) {
            return Ok(ControlOutcome::NotControl);
        }

        let packet = match ServicePacket::parse(plain) {
            Some(packet) => packet,
            // Magic matched but the frame is malformed: swallow.
            None => return Ok(ControlOutcome::Handled),
        };

        match packet {
            ServicePacket::Ping => {
                let pong = ServicePacket::Pong.encode();
                if let Err(e) = peer.egress().send_control(&pong).await {
                    tracing::trace!("pong not sent: {}", e);
                }
                Ok(ControlOutcome::Handled)
            }
            ServicePacket::RekeyInit { client_public } => {
                let fsm = match peer.rekey() {
                    Some(fsm) => fsm,
                    None => return Ok(ControlOutcome::Handled),
                };
                match fsm.server_handle_rekey_init(&client_public, Instant::now()) {
                    Ok(server_public) => {
                        tracing::debug!(
                            internal = %peer.session().internal_addr(),
                            epoch = fsm.last_epoch(),
                            "rekey accepted"
                        );
                        let ack = ServicePacket::RekeyAck { server_public }.encode();
                        if let Err(e) = peer.egress().send_control(&ack).await {
                            tracing::trace!("rekey ack not sent: {}", e);
                        }
                        Ok(ControlOutcome::Handled)
                    }
                    Err(SessionError::EpochExhausted) => {
                        let notice = ServicePacket::EpochExhausted.encode();
                        if let Err(e) = peer.egress().send_control(&notice).await {
                            tracing::trace!("epoch-exhausted notice not sent: {}", e);
                        }
                        Err(SessionError::EpochExhausted)
                    }
                    Err(_) => Ok(ControlOutcome::Handled),
                }
            }
            // Pong, SessionReset, RekeyAck, EpochExhausted and reserved
            // types carry no server-side action.
            _ => Ok(ControlOutcome::Handled),
        }
    }
}

//! Registration handshake
//!
//! A one-round-trip IK-pattern exchange: the client proves possession of
//! its static key against the server's published static key, and the
//! server answers with its ephemeral plus the sealed route id for the new
//! session. Pattern: X25519 + BLAKE2s KDF chain + ChaCha20-Poly1305.
//!
//! The registrar drives implementations of [`HandshakeResponder`] over a
//! [`PacketDuplex`], which adapts a bounded packet queue (read side) and
//! the UDP socket (write side) into something that behaves like a duplex
//! channel. A closed queue surfaces as `UnexpectedEof` and aborts the
//! exchange.

use std::net::SocketAddr;

use async_trait::async_trait;
use rand::Rng;

use crate::crypto::cipher::{open_once, seal_once};
use crate::crypto::kdf;
use crate::crypto::x25519::{self, KEY_LEN};
use crate::error::HandshakeError;

/// Protocol construction label, mixed into the chain by both sides.
const CONSTRUCTION: &[u8] = b"tunwarden-ik-x25519-blake2s-chachapoly";

/// Wire identifier label.
const IDENTIFIER: &[u8] = b"tunwarden v1 registration";

/// Label for the initiation MAC key.
const LABEL_MAC1: &[u8] = b"mac1----";

const MSG_INITIATION: u8 = 0x01;
const MSG_RESPONSE: u8 = 0x02;
const MSG_COOKIE_REPLY: u8 = 0x03;

/// Initiation: type + client_id + ephemeral + sealed static + mac1 + mac2.
const INITIATION_SIZE: usize = 1 + 4 + KEY_LEN + (KEY_LEN + 16) + 16 + 16;

/// Response: type + ephemeral + sealed route id.
const RESPONSE_SIZE: usize = 1 + KEY_LEN + (8 + 16);

/// Cookie reply: type + cookie.
const COOKIE_REPLY_SIZE: usize = 1 + 16;

/// End of the mac1 coverage within an initiation.
const MAC1_OFFSET: usize = INITIATION_SIZE - 32;

/// End of the mac2 coverage within an initiation.
const MAC2_OFFSET: usize = INITIATION_SIZE - 16;

/// Everything the registrar needs to install a session.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    /// Client-chosen id, mapped into the tunnel subnet by the allocator.
    pub client_id: u32,
    /// The client's static public key, proven during the exchange.
    pub pub_key: [u8; KEY_LEN],
    /// Client-to-server transport key.
    pub c2s_key: [u8; KEY_LEN],
    /// Server-to-client transport key.
    pub s2c_key: [u8; KEY_LEN],
    /// Server-assigned route id, sealed into the response.
    pub route_id: u64,
}

/// Duplex packet channel the handshake runs over.
#[async_trait]
pub trait PacketDuplex: Send {
    /// Next inbound packet; `UnexpectedEof` once the queue is closed.
    async fn recv_packet(&mut self) -> std::io::Result<Vec<u8>>;

    /// Write one packet toward the remote address.
    async fn send_packet(&mut self, packet: &[u8]) -> std::io::Result<()>;

    /// The remote address this exchange is bound to (cookie material).
    fn remote_addr(&self) -> SocketAddr;
}

/// Server side of a registration exchange.
#[async_trait]
pub trait HandshakeResponder: Send {
    /// Run the exchange to completion over `io`.
    async fn drive(
        &mut self,
        io: &mut dyn PacketDuplex,
    ) -> Result<HandshakeOutcome, HandshakeError>;
}

/// Produces a fresh responder per registration attempt (and per cookie
/// retry, which must not reuse chain state).
pub trait ResponderFactory: Send + Sync {
    fn responder(&self) -> Box<dyn HandshakeResponder>;
}

/// Symmetric KDF chain state, advanced identically by both sides. Opaque
/// outside this module; it only exists to be threaded between
/// [`IkInitiator::build_initiation`] and
/// [`IkInitiator::process_response`].
pub struct Chain {
    ck: [u8; 32],
    h: [u8; 32],
}

impl Chain {
    fn new(server_public: &[u8; KEY_LEN]) -> Self {
        let ck = kdf::hash(CONSTRUCTION);
        let h = kdf::hash2(&kdf::hash2(&ck, IDENTIFIER), server_public);
        Self { ck, h }
    }

    fn mix_hash(&mut self, data: &[u8]) {
        self.h = kdf::hash2(&self.h, data);
    }

    fn mix_ephemeral(&mut self, ephemeral_public: &[u8; KEY_LEN]) {
        self.mix_hash(ephemeral_public);
        self.ck = kdf::kdf1(&self.ck, ephemeral_public);
    }

    fn mix_key(&mut self, input: &[u8]) -> [u8; 32] {
        let (ck, key) = kdf::kdf2(&self.ck, input);
        self.ck = ck;
        key
    }
}

fn mac1_key(server_public: &[u8; KEY_LEN]) -> [u8; 32] {
    kdf::hash2(LABEL_MAC1, server_public)
}

fn cookie_for(secret: &[u8; 32], addr: SocketAddr) -> [u8; 16] {
    let mut material = Vec::with_capacity(18);
    match addr.ip() {
        std::net::IpAddr::V4(ip) => material.extend_from_slice(&ip.octets()),
        std::net::IpAddr::V6(ip) => material.extend_from_slice(&ip.octets()),
    }
    material.extend_from_slice(&addr.port().to_be_bytes());
    kdf::mac(secret, &material)
}

/// Server responder for the IK registration exchange.
pub struct IkResponder {
    static_private: [u8; KEY_LEN],
    static_public: [u8; KEY_LEN],
    /// When set, un-cookied initiations get a cookie reply and
    /// [`HandshakeError::CookieRequired`]; the registrar retries once.
    cookie_secret: Option<[u8; 32]>,
}

impl IkResponder {
    pub fn new(static_private: [u8; KEY_LEN]) -> Self {
        let static_public = x25519::public_key(&static_private);
        Self {
            static_private,
            static_public,
            cookie_secret: None,
        }
    }

    /// Demand proof of return-routability before doing any DH work.
    pub fn with_cookie_demand(mut self, secret: [u8; 32]) -> Self {
        self.cookie_secret = Some(secret);
        self
    }
}

#[async_trait]
impl HandshakeResponder for IkResponder {
    async fn drive(
        &mut self,
        io: &mut dyn PacketDuplex,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let initiation = io.recv_packet().await?;
        if initiation.first() != Some(&MSG_INITIATION) {
            return Err(HandshakeError::InvalidMessageType {
                msg_type: initiation.first().copied().unwrap_or(0),
            });
        }
        if initiation.len() != INITIATION_SIZE {
            return Err(HandshakeError::InvalidMessageLength {
                expected: INITIATION_SIZE,
                got: initiation.len(),
            });
        }

        // mac1 gates everything else: it proves the sender knows which
        // server it is talking to.
        let expected_mac1 = kdf::mac(&mac1_key(&self.static_public), &initiation[..MAC1_OFFSET]);
        if initiation[MAC1_OFFSET..MAC2_OFFSET] != expected_mac1 {
            return Err(HandshakeError::MacVerificationFailed);
        }

        if let Some(secret) = &self.cookie_secret {
            let cookie = cookie_for(secret, io.remote_addr());
            let expected_mac2 = kdf::mac_keyed16(&cookie, &initiation[..MAC2_OFFSET]);
            if initiation[MAC2_OFFSET..] != expected_mac2 {
                let mut reply = Vec::with_capacity(COOKIE_REPLY_SIZE);
                reply.push(MSG_COOKIE_REPLY);
                reply.extend_from_slice(&cookie);
                io.send_packet(&reply).await?;
                return Err(HandshakeError::CookieRequired);
            }
        }

        let client_id = u32::from_be_bytes(initiation[1..5].try_into().expect("fixed size"));
        let client_ephemeral: [u8; KEY_LEN] =
            initiation[5..5 + KEY_LEN].try_into().expect("fixed size");
        let sealed_static = &initiation[5 + KEY_LEN..5 + KEY_LEN + KEY_LEN + 16];

        let mut chain = Chain::new(&self.static_public);
        chain.mix_hash(&client_id.to_be_bytes());
        chain.mix_ephemeral(&client_ephemeral);

        let es = x25519::dh(&self.static_private, &client_ephemeral);
        let key = chain.mix_key(&es);
        let static_bytes = open_once(&key, 0, sealed_static, &chain.h)?;
        chain.mix_hash(sealed_static);

        let client_static: [u8; KEY_LEN] = static_bytes
            .try_into()
            .map_err(|_| HandshakeError::MacVerificationFailed)?;
        if !x25519::is_valid_public_key(&client_static) {
            return Err(HandshakeError::Failed {
                reason: "degenerate client static key".to_string(),
            });
        }

        let ss = x25519::dh(&self.static_private, &client_static);
        chain.mix_key(&ss);

        // Response: our ephemeral plus the sealed route id.
        let (eph_private, eph_public) = x25519::generate_keypair();
        chain.mix_ephemeral(&eph_public);

        let ee = x25519::dh(&eph_private, &client_ephemeral);
        chain.mix_key(&ee);
        let se = x25519::dh(&eph_private, &client_static);
        let key = chain.mix_key(&se);

        let route_id: u64 = rand::thread_rng().gen();
        let sealed_route = seal_once(&key, 0, &route_id.to_be_bytes(), &chain.h)?;
        chain.mix_hash(&sealed_route);

        let mut response = Vec::with_capacity(RESPONSE_SIZE);
        response.push(MSG_RESPONSE);
        response.extend_from_slice(&eph_public);
        response.extend_from_slice(&sealed_route);
        io.send_packet(&response).await?;

        let (c2s_key, s2c_key) = kdf::kdf2(&chain.ck, &[]);

        Ok(HandshakeOutcome {
            client_id,
            pub_key: client_static,
            c2s_key,
            s2c_key,
            route_id,
        })
    }
}

/// Factory handing the registrar a fresh [`IkResponder`] per attempt.
pub struct IkResponderFactory {
    static_private: [u8; KEY_LEN],
    cookie_secret: Option<[u8; 32]>,
}

impl IkResponderFactory {
    pub fn new(static_private: [u8; KEY_LEN]) -> Self {
        Self {
            static_private,
            cookie_secret: None,
        }
    }

    /// Enable the cookie/DoS gate for every produced responder.
    pub fn with_cookie_demand(mut self, secret: [u8; 32]) -> Self {
        self.cookie_secret = Some(secret);
        self
    }
}

impl ResponderFactory for IkResponderFactory {
    fn responder(&self) -> Box<dyn HandshakeResponder> {
        let responder = IkResponder::new(self.static_private);
        match self.cookie_secret {
            Some(secret) => Box::new(responder.with_cookie_demand(secret)),
            None => Box::new(responder),
        }
    }
}

/// Client side of the exchange. The server never initiates; this exists
/// for client binaries and for exercising the responder in tests.
pub struct IkInitiator {
    static_private: [u8; KEY_LEN],
    static_public: [u8; KEY_LEN],
    server_public: [u8; KEY_LEN],
    client_id: u32,
}

/// What the client learns from a completed exchange.
#[derive(Debug, Clone)]
pub struct InitiatorOutcome {
    pub route_id: u64,
    /// Client-to-server transport key (the client's send key).
    pub c2s_key: [u8; KEY_LEN],
    /// Server-to-client transport key (the client's receive key).
    pub s2c_key: [u8; KEY_LEN],
}

impl IkInitiator {
    pub fn new(
        static_private: [u8; KEY_LEN],
        server_public: [u8; KEY_LEN],
        client_id: u32,
    ) -> Self {
        let static_public = x25519::public_key(&static_private);
        Self {
            static_private,
            static_public,
            server_public,
            client_id,
        }
    }

    /// Build the initiation message; the returned chain state and
    /// ephemeral private key feed [`IkInitiator::process_response`].
    pub fn build_initiation(
        &self,
        cookie: Option<&[u8; 16]>,
    ) -> Result<(Vec<u8>, Chain, [u8; KEY_LEN]), HandshakeError> {
        let (eph_private, eph_public) = x25519::generate_keypair();

        let mut chain = Chain::new(&self.server_public);
        chain.mix_hash(&self.client_id.to_be_bytes());
        chain.mix_ephemeral(&eph_public);

        let es = x25519::dh(&eph_private, &self.server_public);
        let key = chain.mix_key(&es);
        let sealed_static = seal_once(&key, 0, &self.static_public, &chain.h)?;
        chain.mix_hash(&sealed_static);

        let ss = x25519::dh(&self.static_private, &self.server_public);
        chain.mix_key(&ss);

        let mut msg = Vec::with_capacity(INITIATION_SIZE);
        msg.push(MSG_INITIATION);
        msg.extend_from_slice(&self.client_id.to_be_bytes());
        msg.extend_from_slice(&eph_public);
        msg.extend_from_slice(&sealed_static);

        let mac1 = kdf::mac(&mac1_key(&self.server_public), &msg);
        msg.extend_from_slice(&mac1);
        let mac2 = match cookie {
            Some(cookie) => kdf::mac_keyed16(cookie, &msg),
            None => [0u8; 16],
        };
        msg.extend_from_slice(&mac2);

        Ok((msg, chain, eph_private))
    }

    /// Consume the server response produced for an earlier initiation.
    pub fn process_response(
        &self,
        mut chain: Chain,
        eph_private: [u8; KEY_LEN],
        response: &[u8],
    ) -> Result<InitiatorOutcome, HandshakeError> {
        if response.len() != RESPONSE_SIZE {
            return Err(HandshakeError::InvalidMessageLength {
                expected: RESPONSE_SIZE,
                got: response.len(),
            });
        }
        let server_ephemeral: [u8; KEY_LEN] =
            response[1..1 + KEY_LEN].try_into().expect("fixed size");
        let sealed_route = &response[1 + KEY_LEN..];

        chain.mix_ephemeral(&server_ephemeral);
        let ee = x25519::dh(&eph_private, &server_ephemeral);
        chain.mix_key(&ee);
        let se = x25519::dh(&self.static_private, &server_ephemeral);
        let key = chain.mix_key(&se);

        let route_bytes = open_once(&key, 0, sealed_route, &chain.h)?;
        chain.mix_hash(sealed_route);
        let route_id = u64::from_be_bytes(
            route_bytes
                .try_into()
                .map_err(|_| HandshakeError::MacVerificationFailed)?,
        );

        let (c2s_key, s2c_key) = kdf::kdf2(&chain.ck, &[]);
        Ok(InitiatorOutcome {
            route_id,
            c2s_key,
            s2c_key,
        })
    }

    /// Run the exchange, absorbing at most one cookie round trip.
    pub async fn drive(
        &self,
        io: &mut dyn PacketDuplex,
    ) -> Result<InitiatorOutcome, HandshakeError> {
        let (msg, chain, eph_private) = self.build_initiation(None)?;
        io.send_packet(&msg).await?;

        let reply = io.recv_packet().await?;
        match reply.first() {
            Some(&MSG_RESPONSE) => self.process_response(chain, eph_private, &reply),
            Some(&MSG_COOKIE_REPLY) if reply.len() == COOKIE_REPLY_SIZE => {
                let cookie: [u8; 16] = reply[1..].try_into().expect("fixed size");
                let (msg, chain, eph_private) = self.build_initiation(Some(&cookie))?;
                io.send_packet(&msg).await?;
                let reply = io.recv_packet().await?;
                if reply.first() != Some(&MSG_RESPONSE) {
                    return Err(HandshakeError::InvalidMessageType {
                        msg_type: reply.first().copied().unwrap_or(0),
                    });
                }
                self.process_response(chain, eph_private, &reply)
            }
            other => Err(HandshakeError::InvalidMessageType {
                msg_type: other.copied().unwrap_or(0),
            }),
        }
    }
}

//! Error types for the tunwarden server

use thiserror::Error;

/// Main error type for tunwarden
#[derive(Error, Debug)]
pub enum TunWardenError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Registration handshake errors
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Network errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Tunnel device errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Session lifecycle errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid IP address: {value}")]
    InvalidAddress { value: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Packet too short for AEAD framing: {got} bytes")]
    TruncatedPacket { got: usize },

    #[error("No key material for epoch {epoch}")]
    UnknownEpoch { epoch: u16 },
}

/// Registration handshake errors
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The responder demands a cookie round trip; retry once with a
    /// fresh handshake instance.
    #[error("Cookie required")]
    CookieRequired,

    #[error("Handshake timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Handshake failed: {reason}")]
    Failed { reason: String },

    #[error("Invalid handshake message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("Invalid handshake message type: {msg_type}")]
    InvalidMessageType { msg_type: u8 },

    #[error("MAC verification failed")]
    MacVerificationFailed,

    #[error("Unknown client public key")]
    UnknownClient,

    #[error("Client id {client_id} outside the address pool")]
    AddressPoolExhausted { client_id: u32 },

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("Egress closed")]
    EgressClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel device errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to create TUN device: {reason}")]
    CreateFailed { reason: String },

    #[error("TUN read failed: {reason}")]
    ReadFailed { reason: String },

    #[error("TUN write failed: {reason}")]
    WriteFailed { reason: String },

    #[error("Insufficient privileges: {message}")]
    InsufficientPrivileges { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session lifecycle errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Lookup miss; always recoverable by the caller.
    #[error("Session not found")]
    NotFound,

    /// The peer was closed while the operation was in flight.
    #[error("Session closed")]
    Closed,

    /// The epoch counter cannot advance without wrapping.
    #[error("Epoch counter exhausted")]
    EpochExhausted,

    /// A rekey tried to move the epoch backwards or sideways.
    #[error("Stale rekey epoch {epoch} (last accepted {last})")]
    StaleEpoch { epoch: u16, last: u16 },
}

/// Result type alias for tunwarden operations
pub type Result<T> = std::result::Result<T, TunWardenError>;

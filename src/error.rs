use thiserror::Error;

/// The error type used throughout this crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A discovery beacon was shorter than the declared device type allows,
    /// or its extended layout was inconsistent with its length.
    #[error("Malformed beacon packet: {0}")]
    BadPacket(&'static str),

    /// The beacon's device type byte was not one of the known device types.
    #[error("Unknown device type {0} in beacon")]
    UnknownDevice(u8),

    /// The output buffer handed to a serializer was too small.
    #[error("Output buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// The operation was attempted on a pusher that is closing or closed.
    #[error("Pusher is closed")]
    Closed,

    /// A transient socket error. Send errors are counted per pusher;
    /// three consecutive errors close the pusher.
    #[error("Socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// A beacon matched an existing pusher's MAC address but disagreed on
    /// fields that are immutable for the pusher's lifetime.
    #[error("Capability fields changed for pusher {0}")]
    CapabilityMismatch(String),

    /// A second registry was constructed while one already exists in this
    /// process.
    #[error("A registry already exists in this process")]
    AlreadyCreated,
}

pub type Result<T> = std::result::Result<T, Error>;

use std::io;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "rendezvous handshake failed: {}", inner)]
    Rendezvous { inner: io::Error },

    #[fail(display = "connection key or ident string exceeds the {}-byte limit", limit)]
    KeyTooLong { limit: usize },

    #[fail(display = "failed to map the shared-memory segment: {}", inner)]
    SegmentMap { inner: io::Error },

    #[fail(display = "failed to open named semaphore {:?}: {}", name, inner)]
    SemaphoreOpen { name: String, inner: nix::Error },

    #[fail(display = "ABI mismatch: page cookie/version does not match this build")]
    AbiMismatch,

    #[fail(display = "peer is no longer alive (dead-man switch tripped)")]
    PeerDead,

    #[fail(display = "outbound ring is full")]
    RingFull,

    #[fail(display = "resize rejected: {}", reason)]
    ResizeRejected { reason: String },

    #[fail(display = "malformed argument string at byte {}", offset)]
    Argument { offset: usize },

    #[fail(display = "i/o error: {}", inner)]
    Io { inner: io::Error },
}

impl From<io::Error> for Error {
    fn from(inner: io::Error) -> Self {
        Error::Io { inner }
    }
}

impl From<nix::Error> for Error {
    fn from(inner: nix::Error) -> Self {
        Error::SemaphoreOpen {
            name: String::new(),
            inner,
        }
    }
}

use thiserror::Error;

/// All errors produced by tonecast-core.
#[derive(Debug, Error)]
pub enum TonecastError {
    #[error("synthesis engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("voice '{0}' could not be selected")]
    VoiceUnavailable(String),

    #[error("synthesis request failed: {0}")]
    SpeakFailed(String),

    #[error("channel setup failed: {0}")]
    ChannelSetup(String),

    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),

    #[error("no text to speak")]
    EmptyText,

    #[error("channel sink rejected frame: {0}")]
    Sink(String),

    /// The ring's byte count disagreed with its storage. Always a bug.
    #[error("ring buffer accounting fault: expected {expected} bytes, storage holds {actual}")]
    BufferAccounting { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TonecastError {
    /// `true` for faults that indicate broken internal bookkeeping rather
    /// than a failure of an external collaborator.
    pub fn is_internal_fault(&self) -> bool {
        matches!(self, TonecastError::BufferAccounting { .. })
    }
}

pub type Result<T> = std::result::Result<T, TonecastError>;

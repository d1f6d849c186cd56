use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("datagram too short: expected at least {expected} bytes, got {got}")]
    PacketTooShort { expected: usize, got: usize },

    #[error("unknown verb: {0:?}")]
    UnknownVerb(String),

    #[error("bad argument for {verb}: {detail}")]
    BadArgument {
        verb: &'static str,
        detail: String,
    },

    #[error("control line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("control line is not valid UTF-8")]
    NotUtf8,

    #[error("json payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

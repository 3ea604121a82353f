use thiserror::Error;

/// Why a command did not complete with a status byte
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiError {
    #[error("selection timeout")]
    SelectionTimeout,
    #[error("SCSI bus parity error")]
    BusParityError,
    #[error("unexpected disconnect")]
    UnexpectedDisconnect,
    #[error("message rejected by target")]
    MessageRejected,
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    #[error("command timed out")]
    CommandTimeout,
    #[error("no free command blocks")]
    ResourceExhausted,
    #[error("command aborted")]
    Aborted,
    #[error("controller reset")]
    ControllerReset,
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
}

/// Conditions inside the interrupt handler that force a full reset
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpcError {
    #[error("poll budget exhausted waiting for {0}")]
    PollTimeout(&'static str),
    #[error("unexpected bus phase {0}")]
    UnexpectedPhase(u8),
    #[error("SCSI bus reset")]
    BusReset,
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

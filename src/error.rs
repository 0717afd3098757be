use thiserror::Error;

/// Fatal errors that abort [`crate::engine::Engine::start`] (§7, "Fatal at
/// init"). Runtime errors never reach the caller this way: they are either
/// recovered locally or surfaced to the consumer as a typed wire message.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("max_rmid must be in 1..={max_capacity}, got {got}")]
    InvalidMaxRmid { got: u32, max_capacity: u32 },

    #[error("no CPUs were reported online")]
    NoOnlineCpus,

    #[error("timer primitive unavailable: {0}")]
    TimerUnavailable(String),

    #[error("required attachment point missing: {0}")]
    MissingAttachmentPoint(&'static str),
}

pub type InitResult<T> = Result<T, InitError>;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PanelError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not configured: {0}")]
    NotConfigured(&'static str),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HardwareError {
    #[error("gpio {pin} write failed: {reason}")]
    Gpio { pin: i32, reason: String },
    #[error("adc read failed: {0}")]
    Adc(String),
}

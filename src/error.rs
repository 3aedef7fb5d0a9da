#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tun device error: {0}")]
    Tun(#[from] tidy_tuntap::error::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("port {0} already in use")]
    PortInUse(u16),

    #[error("no ephemeral port available")]
    PortExhausted,

    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    #[error("connection was reset by peer")]
    ConnectionReset,

    #[error("connection is closed")]
    ConnectionClosed,
}

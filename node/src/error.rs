use chainlib::error::ChainError;
use thiserror::Error;
use wallet::WalletError;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ServiceError {
    #[error("{0} already started")]
    AlreadyStarted(&'static str),
    #[error("{0} is not running")]
    NotRunning(&'static str),
    #[error("{0} already stopped")]
    AlreadyStopped(&'static str),
}

#[derive(Error, Debug)]
pub enum SwitchError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("reactors cannot be added after the switch started")]
    ReactorAfterStart,
    #[error("duplicate reactor {0}")]
    DuplicateReactor(String),
    #[error("channel {0:#04x} is claimed by two reactors")]
    DuplicateChannel(u8),
    #[error("reactor {name} failed to start: {reason}")]
    ReactorStart { name: String, reason: String },
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("unsupported protocol {0:?}")]
    UnsupportedProtocol(String),
    #[error("peer {0} is already connected")]
    DuplicatePeer(String),
    #[error("connected to self")]
    ConnectToSelf,
    #[error("incompatible peer: {0}")]
    Incompatible(String),
    #[error("too many peers")]
    TooManyPeers,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum GateError {
    #[error("handler already set")]
    AlreadySet,
}

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("failed to bind rpc listener {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("invalid rpc address {0:?}")]
    InvalidAddress(String),
    #[error("rpc listener {0} closed with an error")]
    Serve(String),
}

/// Alias resolution failures for transaction build requests.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BuildRequestError {
    #[error("invalid asset alias {alias} on action {index}")]
    InvalidAssetAlias { index: usize, alias: String },
    #[error("invalid account alias {alias} on action {index}")]
    InvalidAccountAlias { index: usize, alias: String },
}

/// Fatal startup failures. Any of these keeps the node from reaching the
/// running state.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("failed to start event switch: {0}")]
    EventSwitch(ServiceError),
    #[error("failed to open storage: {0}")]
    Storage(ChainError),
    #[error("failed to add genesis block to chain: {0}")]
    Genesis(ChainError),
    #[error("failed to prepare wallet pins: {0}")]
    PinStore(WalletError),
    #[error("failed to initialize wallet: {0}")]
    Wallet(WalletError),
    #[error("initialize HSM failed: {0}")]
    Hsm(WalletError),
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Switch(#[from] SwitchError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("failed to install core handler: {0}")]
    Gate(#[from] GateError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<ciborium::de::Error<std::io::Error>> for SwitchError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        SwitchError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for SwitchError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        SwitchError::Codec(e.to_string())
    }
}

//! Crate-wide error type aggregating the subsystem errors.

use thiserror::Error;

use crate::agi::AgiError;
use crate::config::ConfigError;
use crate::dialer::DialerError;
use crate::dialog::DialogError;
use crate::federation::node::NodeError;
use crate::federation::transport::TransportError;
use crate::pbx::manager::ManagerError;
use crate::sms::SmsError;

/// Top-level error for trunkline operations.
#[derive(Debug, Error)]
pub enum TrunklineError {
    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dialog(#[from] DialogError),

    #[error(transparent)]
    Agi(#[from] AgiError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Dialer(#[from] DialerError),

    #[error(transparent)]
    Sms(#[from] SmsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

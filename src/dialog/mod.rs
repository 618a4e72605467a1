//! Dialog-scripting runtime: a finite state machine over named nodes with
//! audio prompting, DTMF/ASR input, recording, custom hooks, error
//! handling with visit-count rerouting, and structured call history.

pub mod dialog;
pub mod eval;
pub mod history;
pub mod items;
pub mod node;

use thiserror::Error;

pub use dialog::{CustomCallback, Dialog, DialogHook, NodeBuilder, NodeHook};
pub use eval::{Destination, EvalExpr, NodeKey, ResolvedDest};
pub use history::{CallHistory, NodeRecord};
pub use items::{
    AudioItem, AudioSource, AudioValue, CustomItem, ErrorPolicy, InputMode, InputSettings,
    OptionItem, RecordItem,
};
pub use node::{DialogNode, NodeEvent};

use crate::agi::AgiError;

/// Errors raised while building or running a dialog.
#[derive(Debug, Error)]
pub enum DialogError {
    /// The dialog failed pre-run validation and cannot be run.
    #[error("dialog is not valid: {0}")]
    Invalid(String),

    #[error("destination {dest:?} cannot be parsed: {reason}")]
    BadDestination { dest: String, reason: String },

    #[error("custom callback {0:?} is not registered")]
    UnknownCallback(String),

    #[error("custom callback {0:?} failed: {1}")]
    CallbackFailed(String, String),

    #[error("audio prompt has no value for audio index {0}")]
    MissingAudioIndex(usize),

    #[error("referenced node {0} does not exist")]
    MissingNode(String),

    /// The call channel failed or hung up mid-dialog.
    #[error(transparent)]
    Agi(#[from] AgiError),
}

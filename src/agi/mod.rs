//! FastAGI server and the synchronous AGI client API.
//!
//! The server accepts inbound call legs from the PBX and binds each one to
//! the right handler session; the client wraps the AGI wire protocol in a
//! friendly synchronous API that application threads block on.

pub mod response;
pub mod server;
pub mod session;

use std::time::SystemTime;

pub use response::{AgiError, AgiResponse, PLAYBACK_FAILED};
pub use server::{FastAgiServer, HandlerSlot};
pub use session::{AgiEnvironment, AgiSession};

use crate::domain::SessionId;

/// Confidence score above which a recognition hypothesis counts as HIGH.
pub const ASR_CONFIDENCE_THRESHOLD: f64 = 0.5;

/// All DTMF digits, used when a node accepts any key as interrupt input.
pub const ALL_DTMF_DIGITS: &str = "0123456789*#";

/// How the dialog should report the session's end to the PBX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HangupStatus {
    #[default]
    Hangup,
    Success,
    Failure,
}

impl HangupStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hangup => "HANGUP",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

/// Recognition confidence classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceLevel {
    High,
    Low,
}

/// Outcome of one audio prompt: what the caller did.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptResult {
    /// Input was required and none arrived in time.
    Timeout,
    /// No input was required; the dialog takes its default route.
    NoInput,
    /// A DTMF digit arrived.
    Dtmf {
        digit: String,
        barged_in: bool,
        input_at: SystemTime,
        playback_stopped_at: SystemTime,
    },
    /// A recognition hypothesis arrived.
    Asr {
        utterance: String,
        level: ConfidenceLevel,
        score: f64,
        barged_in: bool,
        barge_in_frame: u32,
    },
}

/// ASR prompt parameters.
#[derive(Debug, Clone)]
pub struct AsrSettings {
    pub grammar: String,
    pub recognition_timeout_ms: u32,
    pub barge_in_duration_ms: u32,
    pub consecutive_speech_duration_ms: u32,
    pub silence_timeout_ms: u32,
}

/// Recording request parameters.
#[derive(Debug, Clone)]
pub struct RecordingRequest {
    pub filename: String,
    /// Maximum clip length in milliseconds; -1 means unbounded.
    pub max_time_ms: i64,
    pub interrupt_keys: String,
    pub play_beep: bool,
    pub silence_timeout_secs: Option<u32>,
    pub custom_silence_detection: bool,
}

/// Result of a recording: where the clip landed plus silence metadata when
/// custom silence detection ran.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingOutcome {
    pub local_path: String,
    pub silence_percentage: Option<f64>,
    pub hash_terminated: bool,
}

/// Result of a call transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub status: String,
    /// Bridged duration in milliseconds; -1 when the call was not answered.
    pub bridged_millis: i64,
}

/// The slice of the AGI client the dialog runtime drives. The production
/// implementation is [`AgiSession`]; tests script their own.
pub trait IvrSession: Send {
    fn caller_id(&self) -> Option<String>;
    fn dialed_number(&self) -> Option<String>;
    fn session_id(&self) -> SessionId;

    fn play_dtmf(
        &mut self,
        filename: &str,
        valid: &str,
        max_timeout_ms: u32,
        delay_after_input_secs: u64,
    ) -> Result<PromptResult, AgiError>;

    fn say_dtmf(
        &mut self,
        text: &str,
        valid: &str,
        max_timeout_ms: u32,
    ) -> Result<PromptResult, AgiError>;

    fn play_asr(&mut self, filename: &str, settings: &AsrSettings)
    -> Result<PromptResult, AgiError>;

    fn say_asr(&mut self, text: &str, settings: &AsrSettings) -> Result<PromptResult, AgiError>;

    fn record_audio(&mut self, request: &RecordingRequest) -> Result<RecordingOutcome, AgiError>;

    fn hangup(&mut self, status: HangupStatus) -> Result<(), AgiError>;
}

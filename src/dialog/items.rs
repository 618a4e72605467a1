//! The data items a dialog node carries: audio prompts, input settings,
//! options, error policy, recording and custom hooks.

use std::collections::HashMap;

use crate::agi::RecordingRequest;
use crate::dialog::eval::Destination;

/// Where an audio prompt comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSource {
    /// An audio file played back by the PBX.
    File,
    /// Text rendered through TTS.
    Text,
}

/// Prompt content: a single value or one value per audio index, used for
/// multi-lingual dialogs where the active language picks the variant.
#[derive(Debug, Clone)]
pub enum AudioValue {
    Single(String),
    Indexed(HashMap<usize, String>),
}

/// One audio prompt at a node.
#[derive(Debug, Clone)]
pub struct AudioItem {
    pub source: AudioSource,
    pub value: AudioValue,
}

impl AudioItem {
    #[must_use]
    pub fn file(value: &str) -> Self {
        Self {
            source: AudioSource::File,
            value: AudioValue::Single(value.to_string()),
        }
    }

    #[must_use]
    pub fn text(value: &str) -> Self {
        Self {
            source: AudioSource::Text,
            value: AudioValue::Single(value.to_string()),
        }
    }

    /// The prompt value for the given audio index.
    #[must_use]
    pub fn value_for(&self, index: usize) -> Option<&str> {
        match &self.value {
            AudioValue::Single(value) => Some(value),
            AudioValue::Indexed(values) => values.get(&index).map(String::as_str),
        }
    }
}

/// Input mode of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Dtmf,
    Asr,
}

/// How a node collects caller input.
#[derive(Debug, Clone)]
pub enum InputSettings {
    Dtmf {
        /// Milliseconds to wait for input after the last prompt.
        max_time_ms: u32,
        /// Error visits tolerated before rerouting.
        max_visit_count: u32,
        /// Whether any digit interrupts playback, or only declared options.
        use_all_dtmf: bool,
    },
    Asr {
        max_time_ms: u32,
        max_visit_count: u32,
        barge_in_duration_ms: u32,
        consecutive_speech_duration_ms: u32,
        silence_timeout_ms: u32,
        grammar: String,
    },
}

impl InputSettings {
    #[must_use]
    pub fn mode(&self) -> InputMode {
        match self {
            Self::Dtmf { .. } => InputMode::Dtmf,
            Self::Asr { .. } => InputMode::Asr,
        }
    }

    #[must_use]
    pub fn max_time_ms(&self) -> u32 {
        match self {
            Self::Dtmf { max_time_ms, .. } | Self::Asr { max_time_ms, .. } => *max_time_ms,
        }
    }

    #[must_use]
    pub fn max_visit_count(&self) -> u32 {
        match self {
            Self::Dtmf {
                max_visit_count, ..
            }
            | Self::Asr {
                max_visit_count, ..
            } => *max_visit_count,
        }
    }

    #[must_use]
    pub fn use_all_dtmf(&self) -> bool {
        match self {
            Self::Dtmf { use_all_dtmf, .. } => *use_all_dtmf,
            Self::Asr { .. } => false,
        }
    }
}

/// One selectable input option and where it leads.
#[derive(Debug, Clone)]
pub struct OptionItem {
    pub option: String,
    pub dest: Destination,
}

impl OptionItem {
    #[must_use]
    pub fn new(option: &str, dest: Destination) -> Self {
        Self {
            option: option.to_string(),
            dest,
        }
    }
}

/// Error destinations of a node: UNKNOWN and TIMEOUT while under the visit
/// limit, REROUTE once it is exhausted.
#[derive(Debug, Clone)]
pub struct ErrorPolicy {
    pub unknown: Destination,
    pub timeout: Destination,
    pub reroute: Destination,
}

/// Recording parameters for a node.
#[derive(Debug, Clone)]
pub struct RecordItem {
    pub filename: String,
    pub max_time_ms: i64,
    pub interrupt_keys: String,
    pub play_beep: bool,
    pub silence_timeout_secs: Option<u32>,
    pub custom_silence_detection: bool,
}

impl RecordItem {
    /// Lowers into the AGI recording request.
    #[must_use]
    pub fn to_request(&self) -> RecordingRequest {
        RecordingRequest {
            filename: self.filename.clone(),
            max_time_ms: self.max_time_ms,
            interrupt_keys: self.interrupt_keys.clone(),
            play_beep: self.play_beep,
            silence_timeout_secs: self.silence_timeout_secs,
            custom_silence_detection: self.custom_silence_detection,
        }
    }
}

/// A custom hook: the name of a callback pre-registered on the dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomItem {
    pub callback: String,
}

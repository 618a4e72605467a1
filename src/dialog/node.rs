//! A node in the dialog state machine.
//!
//! Each node steps through its items by signalling events: custom hooks
//! first, then audio prompts, then option/record processing, with error
//! events bounded by the visit count.

use std::collections::HashMap;

use crate::dialog::eval::{Destination, NodeKey, ResolvedDest};
use crate::dialog::items::{
    AudioItem, CustomItem, ErrorPolicy, InputMode, InputSettings, OptionItem, RecordItem,
};

/// Events a node signals through its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    Custom,
    Audio,
    Option,
    Record,
    Unknown,
    Timeout,
    Reroute,
    Exit,
}

/// One dialog state.
#[derive(Debug, Clone)]
pub struct DialogNode {
    key: NodeKey,
    raw_name: String,
    input: Option<InputSettings>,
    error: Option<ErrorPolicy>,
    goto: Option<Destination>,
    audio: Vec<AudioItem>,
    custom: Vec<CustomItem>,
    options: HashMap<String, OptionItem>,
    record: Option<RecordItem>,
    apply_globals: bool,
    exit: bool,

    event: NodeEvent,
    audio_index: usize,
    custom_index: usize,
    visit_count: u32,
}

impl DialogNode {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        raw_name: String,
        input: Option<InputSettings>,
        error: Option<ErrorPolicy>,
        goto: Option<Destination>,
        audio: Vec<AudioItem>,
        custom: Vec<CustomItem>,
        options: HashMap<String, OptionItem>,
        record: Option<RecordItem>,
        apply_globals: bool,
        exit: bool,
    ) -> Self {
        Self {
            key: NodeKey::from_name(&raw_name),
            raw_name,
            input,
            error,
            goto,
            audio,
            custom,
            options,
            record,
            apply_globals,
            exit,
            event: NodeEvent::Custom,
            audio_index: 0,
            custom_index: 0,
            visit_count: 0,
        }
    }

    #[must_use]
    pub fn key(&self) -> NodeKey {
        self.key
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.raw_name
    }

    #[must_use]
    pub fn event(&self) -> NodeEvent {
        self.event
    }

    pub fn set_event(&mut self, event: NodeEvent) {
        self.event = event;
    }

    /// Rewinds item access and signals the start-off custom event.
    pub fn reset(&mut self) {
        self.audio_index = 0;
        self.custom_index = 0;
        self.event = NodeEvent::Custom;
    }

    /// Next custom hook, or `None` (signalling the audio event) when they
    /// are exhausted.
    pub fn next_custom(&mut self) -> Option<CustomItem> {
        match self.custom.get(self.custom_index) {
            Some(item) => {
                self.custom_index += 1;
                Some(item.clone())
            }
            None => {
                self.event = NodeEvent::Audio;
                None
            }
        }
    }

    /// Next audio prompt. The first prompt of a visit bumps the visit
    /// count; exhaustion signals record, exit or option processing.
    pub fn next_audio(&mut self) -> Option<AudioItem> {
        if self.audio_index == 0 {
            self.visit_count += 1;
        }
        match self.audio.get(self.audio_index) {
            Some(item) => {
                self.audio_index += 1;
                Some(item.clone())
            }
            None => {
                self.event = if self.record.is_some() {
                    NodeEvent::Record
                } else if self.exit {
                    NodeEvent::Exit
                } else {
                    NodeEvent::Option
                };
                None
            }
        }
    }

    /// The recording item; signals the follow-up event.
    pub fn take_record(&mut self) -> Option<RecordItem> {
        self.event = if self.exit {
            NodeEvent::Exit
        } else {
            NodeEvent::Option
        };
        self.record.clone()
    }

    /// Resolves an option token into a destination.
    ///
    /// The routing tokens `GOTO`/`TIMEOUT`/`UNKNOWN`/`REROUTE` consult the
    /// node's bindings; anything else is looked up in the dialog globals
    /// (when this node applies them) and then the node's own options.
    /// Valid non-error routes reset the visit count.
    #[must_use]
    pub fn resolve_dest(
        &mut self,
        token: &str,
        globals: &HashMap<String, OptionItem>,
        visited: &[NodeKey],
    ) -> Option<ResolvedDest> {
        match token {
            "CURRENT" => {
                self.visit_count = 0;
                Some(ResolvedDest::Current)
            }
            "PREVIOUS" => {
                self.visit_count = 0;
                Some(ResolvedDest::Previous)
            }
            "GOTO" => {
                self.visit_count = 0;
                self.goto.as_ref()?.resolve(visited)
            }
            "TIMEOUT" => self.error.as_ref()?.timeout.resolve(visited),
            "UNKNOWN" => self.error.as_ref()?.unknown.resolve(visited),
            "REROUTE" => {
                self.visit_count = 0;
                self.error.as_ref()?.reroute.resolve(visited)
            }
            input => {
                let item = if self.apply_globals && globals.contains_key(input) {
                    globals.get(input)
                } else {
                    self.options.get(input)
                }?;
                self.visit_count = 0;
                item.dest.resolve(visited)
            }
        }
    }

    /// Milliseconds to wait for input once the prompt queue is empty; zero
    /// while prompts remain (only the last one is interruptible).
    #[must_use]
    pub fn max_time_ms(&self) -> u32 {
        if self.audio_index < self.audio.len() {
            0
        } else {
            self.input.as_ref().map_or(0, InputSettings::max_time_ms)
        }
    }

    #[must_use]
    pub fn max_visit_count(&self) -> u32 {
        self.input.as_ref().map_or(0, InputSettings::max_visit_count)
    }

    #[must_use]
    pub fn visit_count(&self) -> u32 {
        self.visit_count
    }

    #[must_use]
    pub fn input_mode(&self) -> InputMode {
        self.input.as_ref().map_or(InputMode::Dtmf, InputSettings::mode)
    }

    #[must_use]
    pub fn input_settings(&self) -> Option<&InputSettings> {
        self.input.as_ref()
    }

    #[must_use]
    pub fn use_all_dtmf(&self) -> bool {
        self.input.as_ref().is_none_or(InputSettings::use_all_dtmf)
    }

    /// The option keys declared on this node, concatenated for use as an
    /// interrupt-key string.
    #[must_use]
    pub fn options_string(&self) -> String {
        self.options.keys().cloned().collect()
    }

    #[must_use]
    pub fn has_options(&self) -> bool {
        !self.options.is_empty()
    }

    #[must_use]
    pub fn is_exit(&self) -> bool {
        self.exit
    }

    #[must_use]
    pub fn applies_globals(&self) -> bool {
        self.apply_globals
    }

    // Validation accessors.

    #[must_use]
    pub(crate) fn goto_dest(&self) -> Option<&Destination> {
        self.goto.as_ref()
    }

    #[must_use]
    pub(crate) fn error_policy(&self) -> Option<&ErrorPolicy> {
        self.error.as_ref()
    }

    #[must_use]
    pub(crate) fn option_items(&self) -> &HashMap<String, OptionItem> {
        &self.options
    }

    #[must_use]
    pub(crate) fn custom_items(&self) -> &[CustomItem] {
        &self.custom
    }
}

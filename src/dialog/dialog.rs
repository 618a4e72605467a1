//! The dialog: a named set of nodes run as a finite state machine over one
//! call session.
//!
//! Execution is a single-threaded event loop driven by the current node's
//! event. Custom hooks fire first, then audio prompts (only the last one
//! interruptible), then the caller's input picks the next node; invalid
//! input and timeouts route through the node's error policy, bounded by
//! its visit count.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;

use tracing::{error, info};

use crate::agi::{
    ALL_DTMF_DIGITS, AsrSettings, ConfidenceLevel, IvrSession, PromptResult, RecordingOutcome,
};
use crate::dialog::DialogError;
use crate::dialog::eval::{Destination, NodeKey, ResolvedDest};
use crate::dialog::history::CallHistory;
use crate::dialog::items::{
    AudioItem, AudioSource, AudioValue, CustomItem, ErrorPolicy, InputMode, InputSettings,
    OptionItem, RecordItem,
};
use crate::dialog::node::{DialogNode, NodeEvent};

/// A user-supplied hook fired at a node's custom event. Receives the live
/// node and the dialog-wide shared results map.
pub type CustomCallback =
    Box<dyn FnMut(&mut DialogNode, &mut HashMap<String, String>) -> Result<(), String> + Send>;

/// Hook fired after each node completes, before it is reset.
pub type NodeHook = Box<dyn FnMut(&DialogNode) + Send>;

/// Hook fired once the dialog terminates, gracefully or not.
pub type DialogHook = Box<dyn FnMut() + Send>;

/// Declarative description of one node, consumed by [`Dialog::add_node`].
#[derive(Debug, Default)]
pub struct NodeBuilder {
    name: String,
    input: Option<InputSettings>,
    error: Option<(String, String, String)>,
    goto: Option<String>,
    audio: Vec<AudioItem>,
    custom: Vec<String>,
    options: Vec<(String, String)>,
    record: Option<RecordItem>,
    skip_globals: bool,
    exit: bool,
}

impl NodeBuilder {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Appends an audio-file prompt.
    #[must_use]
    pub fn audio_file(mut self, filename: &str) -> Self {
        self.audio.push(AudioItem::file(filename));
        self
    }

    /// Appends a TTS prompt.
    #[must_use]
    pub fn audio_text(mut self, text: &str) -> Self {
        self.audio.push(AudioItem::text(text));
        self
    }

    /// Appends an indexed (multi-lingual) prompt.
    #[must_use]
    pub fn audio_indexed(mut self, source: AudioSource, values: HashMap<usize, String>) -> Self {
        self.audio.push(AudioItem {
            source,
            value: AudioValue::Indexed(values),
        });
        self
    }

    /// DTMF input accepting any digit as interrupt.
    #[must_use]
    pub fn dtmf_input(mut self, max_time_ms: u32, max_visit_count: u32) -> Self {
        self.input = Some(InputSettings::Dtmf {
            max_time_ms,
            max_visit_count,
            use_all_dtmf: true,
        });
        self
    }

    /// DTMF input accepting only declared options as interrupts.
    #[must_use]
    pub fn dtmf_input_strict(mut self, max_time_ms: u32, max_visit_count: u32) -> Self {
        self.input = Some(InputSettings::Dtmf {
            max_time_ms,
            max_visit_count,
            use_all_dtmf: false,
        });
        self
    }

    /// ASR input with the given recognizer settings.
    #[must_use]
    pub fn asr_input(
        mut self,
        max_time_ms: u32,
        max_visit_count: u32,
        grammar: &str,
        barge_in_duration_ms: u32,
        consecutive_speech_duration_ms: u32,
        silence_timeout_ms: u32,
    ) -> Self {
        self.input = Some(InputSettings::Asr {
            max_time_ms,
            max_visit_count,
            barge_in_duration_ms,
            consecutive_speech_duration_ms,
            silence_timeout_ms,
            grammar: grammar.to_string(),
        });
        self
    }

    /// Error destinations for UNKNOWN, TIMEOUT and REROUTE.
    #[must_use]
    pub fn on_error(mut self, unknown: &str, timeout: &str, reroute: &str) -> Self {
        self.error = Some((unknown.to_string(), timeout.to_string(), reroute.to_string()));
        self
    }

    /// Default next-node destination.
    #[must_use]
    pub fn goto(mut self, dest: &str) -> Self {
        self.goto = Some(dest.to_string());
        self
    }

    /// Maps an input option to a destination.
    #[must_use]
    pub fn option(mut self, option: &str, dest: &str) -> Self {
        self.options.push((option.to_string(), dest.to_string()));
        self
    }

    /// Adds a custom hook by registered callback name.
    #[must_use]
    pub fn custom(mut self, callback: &str) -> Self {
        self.custom.push(callback.to_string());
        self
    }

    /// Records audio at this node.
    #[must_use]
    pub fn record(mut self, record: RecordItem) -> Self {
        self.record = Some(record);
        self
    }

    /// Ignores the dialog's global options at this node.
    #[must_use]
    pub fn without_globals(mut self) -> Self {
        self.skip_globals = true;
        self
    }

    /// Ends the dialog after this node.
    #[must_use]
    pub fn exit(mut self) -> Self {
        self.exit = true;
        self
    }

    fn build(self) -> Result<DialogNode, DialogError> {
        let goto = self.goto.as_deref().map(Destination::parse).transpose()?;
        let error = match &self.error {
            Some((unknown, timeout, reroute)) => Some(ErrorPolicy {
                unknown: Destination::parse(unknown)?,
                timeout: Destination::parse(timeout)?,
                reroute: Destination::parse(reroute)?,
            }),
            None => None,
        };
        let mut options = HashMap::new();
        for (option, dest) in &self.options {
            options.insert(
                option.clone(),
                OptionItem::new(option, Destination::parse(dest)?),
            );
        }
        let custom = self
            .custom
            .into_iter()
            .map(|callback| CustomItem { callback })
            .collect();
        Ok(DialogNode::new(
            self.name,
            self.input,
            error,
            goto,
            self.audio,
            custom,
            options,
            self.record,
            !self.skip_globals,
            self.exit,
        ))
    }
}

/// An IVR dialog.
pub struct Dialog {
    nodes: HashMap<NodeKey, DialogNode>,
    global_opts: HashMap<String, OptionItem>,
    callbacks: HashMap<String, CustomCallback>,
    start: Option<NodeKey>,
    current: Option<NodeKey>,
    visited: Vec<NodeKey>,
    custom_results: HashMap<String, String>,
    audio_index: usize,
    delay_after_input_secs: u64,
    last_input: Option<String>,
    last_asr_score: Option<f64>,
    last_asr_high: Option<bool>,
    last_record: Option<RecordingOutcome>,
    history: Option<CallHistory>,
    dialog_completed: bool,
    finalize_node: Option<NodeHook>,
    finalize_dialog: Option<DialogHook>,
}

impl Default for Dialog {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialog {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            global_opts: HashMap::new(),
            callbacks: HashMap::new(),
            start: None,
            current: None,
            visited: Vec::new(),
            custom_results: HashMap::new(),
            audio_index: 0,
            delay_after_input_secs: 0,
            last_input: None,
            last_asr_score: None,
            last_asr_high: None,
            last_record: None,
            history: None,
            dialog_completed: false,
            finalize_node: None,
            finalize_dialog: None,
        }
    }

    /// Adds a node described by the builder.
    pub fn add_node(&mut self, builder: NodeBuilder) -> Result<(), DialogError> {
        let node = builder.build()?;
        self.nodes.insert(node.key(), node);
        Ok(())
    }

    /// Convenience: a node that only runs custom hooks.
    pub fn add_custom_node(
        &mut self,
        name: &str,
        callbacks: &[&str],
        goto: Option<&str>,
    ) -> Result<(), DialogError> {
        let mut builder = NodeBuilder::new(name);
        for callback in callbacks {
            builder = builder.custom(callback);
        }
        if let Some(goto) = goto {
            builder = builder.goto(goto);
        }
        self.add_node(builder)
    }

    /// Convenience: an uninterruptible playback node.
    pub fn add_playback_node(
        &mut self,
        name: &str,
        audio: Vec<AudioItem>,
        goto: Option<&str>,
        exit: bool,
    ) -> Result<(), DialogError> {
        let mut builder = NodeBuilder::new(name);
        builder.audio = audio;
        if let Some(goto) = goto {
            builder = builder.goto(goto);
        }
        if exit {
            builder = builder.exit();
        }
        self.add_node(builder)
    }

    /// Convenience: a DTMF input prompt node.
    #[allow(clippy::too_many_arguments)]
    pub fn add_dtmf_input_node(
        &mut self,
        name: &str,
        max_time_ms: u32,
        max_visit_count: u32,
        error: (&str, &str, &str),
        audio: Vec<AudioItem>,
        options: &[(&str, &str)],
    ) -> Result<(), DialogError> {
        let mut builder = NodeBuilder::new(name)
            .dtmf_input(max_time_ms, max_visit_count)
            .on_error(error.0, error.1, error.2);
        builder.audio = audio;
        for (option, dest) in options {
            builder = builder.option(option, dest);
        }
        self.add_node(builder)
    }

    /// Convenience: an ASR input prompt node. High-confidence hypotheses
    /// follow the goto destination; low confidence routes to the UNKNOWN
    /// error destination.
    #[allow(clippy::too_many_arguments)]
    pub fn add_asr_input_node(
        &mut self,
        name: &str,
        max_time_ms: u32,
        max_visit_count: u32,
        grammar: &str,
        error: (&str, &str, &str),
        goto: &str,
        audio: Vec<AudioItem>,
    ) -> Result<(), DialogError> {
        let mut builder = NodeBuilder::new(name)
            .asr_input(max_time_ms, max_visit_count, grammar, 100, 5000, 1000)
            .on_error(error.0, error.1, error.2)
            .goto(goto);
        builder.audio = audio;
        self.add_node(builder)
    }

    /// Sets the starting node by name.
    pub fn set_start_node(&mut self, name: &str) {
        self.start = Some(NodeKey::from_name(name));
    }

    /// Global input options active at every node that applies globals.
    pub fn set_global_options(&mut self, options: &[(&str, &str)]) -> Result<(), DialogError> {
        self.global_opts.clear();
        for (option, dest) in options {
            self.global_opts.insert(
                (*option).to_string(),
                OptionItem::new(option, Destination::parse(dest)?),
            );
        }
        Ok(())
    }

    /// Selects which indexed audio variant plays, e.g. the caller's
    /// language.
    pub fn set_audio_index(&mut self, index: usize) {
        self.audio_index = index;
    }

    /// Seconds to wait after DTMF input before continuing.
    pub fn set_delay_after_input(&mut self, secs: u64) {
        self.delay_after_input_secs = secs;
    }

    /// Registers a named custom callback invoked by custom items.
    pub fn register_callback(&mut self, name: &str, callback: CustomCallback) {
        self.callbacks.insert(name.to_string(), callback);
    }

    /// Hook fired after each node completes.
    pub fn set_finalize_node(&mut self, hook: NodeHook) {
        self.finalize_node = Some(hook);
    }

    /// Hook fired when the dialog terminates.
    pub fn set_finalize_dialog(&mut self, hook: DialogHook) {
        self.finalize_dialog = Some(hook);
    }

    /// The most recent input (DTMF digit or ASR utterance).
    #[must_use]
    pub fn last_input(&self) -> Option<&str> {
        self.last_input.as_deref()
    }

    #[must_use]
    pub fn last_asr_confidence_score(&self) -> Option<f64> {
        self.last_asr_score
    }

    #[must_use]
    pub fn was_last_asr_confidence_level_high(&self) -> Option<bool> {
        self.last_asr_high
    }

    #[must_use]
    pub fn last_recording_silence_percentage(&self) -> Option<f64> {
        self.last_record
            .as_ref()
            .and_then(|outcome| outcome.silence_percentage)
    }

    #[must_use]
    pub fn call_history(&self) -> Option<&CallHistory> {
        self.history.as_ref()
    }

    /// Attaches application data to the current visit's history record.
    pub fn set_custom_history(&mut self, data: HashMap<String, String>) {
        if let Some(history) = &mut self.history {
            history.set_custom(data);
        }
    }

    /// The node visited before the current one, if any.
    #[must_use]
    pub fn previous_node(&self) -> Option<&DialogNode> {
        self.visited.last().and_then(|key| self.nodes.get(key))
    }

    #[must_use]
    pub fn shared_results(&self) -> &HashMap<String, String> {
        &self.custom_results
    }

    /// Pre-run validation: every referenced destination must resolve to a
    /// declared node (or be relative) and every custom hook must name a
    /// registered callback.
    pub fn validate(&self) -> Result<(), DialogError> {
        let mut problems = Vec::new();
        match self.start {
            None => problems.push("no start node set".to_string()),
            Some(start) if !self.nodes.contains_key(&start) => {
                problems.push("start node is not declared".to_string());
            }
            Some(_) => {}
        }

        let check_dest = |problems: &mut Vec<String>, node_name: &str, what: &str, dest: &Destination| {
            for name in dest.referenced_names() {
                if !self.nodes.contains_key(&NodeKey::from_name(name)) {
                    problems.push(format!(
                        "node {node_name}: {what} destination {name:?} is not declared"
                    ));
                }
            }
        };
        for node in self.nodes.values() {
            if let Some(goto) = node.goto_dest() {
                check_dest(&mut problems, node.name(), "goto", goto);
            }
            if let Some(policy) = node.error_policy() {
                check_dest(&mut problems, node.name(), "unknown", &policy.unknown);
                check_dest(&mut problems, node.name(), "timeout", &policy.timeout);
                check_dest(&mut problems, node.name(), "reroute", &policy.reroute);
            }
            for item in node.option_items().values() {
                check_dest(&mut problems, node.name(), "option", &item.dest);
            }
            for item in node.custom_items() {
                if !self.callbacks.contains_key(&item.callback) {
                    problems.push(format!(
                        "node {}: custom callback {:?} is not registered",
                        node.name(),
                        item.callback
                    ));
                }
            }
        }
        for item in self.global_opts.values() {
            for name in item.dest.referenced_names() {
                if !self.nodes.contains_key(&NodeKey::from_name(name)) {
                    problems.push(format!(
                        "global option {:?}: destination {name:?} is not declared",
                        item.option
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(DialogError::Invalid(problems.join("; ")))
        }
    }

    /// Runs the dialog over the given session.
    pub fn run(&mut self, session: &mut dyn IvrSession) -> Result<(), DialogError> {
        self.validate()?;
        let start = self.start.ok_or_else(|| {
            DialogError::Invalid("no start node set".into())
        })?;

        let start_time = SystemTime::now();
        self.history = Some(CallHistory::new(
            session.session_id().to_string(),
            start_time,
            session.caller_id(),
            session.dialed_number(),
        ));
        self.current = Some(start);
        let start_name = self.node_name(start)?;
        if let Some(history) = &mut self.history {
            history.start_node(&start_name, start_time);
        }

        let outcome = self.event_loop(session);

        let end_time = SystemTime::now();
        if let Some(history) = &mut self.history {
            history.end_node(end_time);
            history.set_hangup_time(end_time);
        }
        if let Some(hook) = &mut self.finalize_dialog {
            hook();
        }
        if self.dialog_completed {
            info!("user hangup; reason = expected hangup");
        } else {
            info!("user hangup; reason = unexpected hangup");
        }
        outcome
    }

    fn node_name(&self, key: NodeKey) -> Result<String, DialogError> {
        self.nodes
            .get(&key)
            .map(|node| node.name().to_string())
            .ok_or_else(|| DialogError::MissingNode(format!("{key:?}")))
    }

    #[allow(clippy::too_many_lines)]
    fn event_loop(&mut self, session: &mut dyn IvrSession) -> Result<(), DialogError> {
        let mut pending = PromptResult::NoInput;
        loop {
            let current = self
                .current
                .ok_or_else(|| DialogError::Invalid("no current node".into()))?;
            let event = self
                .nodes
                .get(&current)
                .ok_or_else(|| DialogError::MissingNode(format!("{current:?}")))?
                .event();

            match event {
                NodeEvent::Custom => {
                    let item = self
                        .nodes
                        .get_mut(&current)
                        .expect("current node present")
                        .next_custom();
                    if let Some(item) = item {
                        let callback = self
                            .callbacks
                            .get_mut(&item.callback)
                            .ok_or_else(|| DialogError::UnknownCallback(item.callback.clone()))?;
                        let node = self.nodes.get_mut(&current).expect("current node present");
                        callback(node, &mut self.custom_results).map_err(|message| {
                            error!("custom hook {} failed: {message}", item.callback);
                            DialogError::CallbackFailed(item.callback.clone(), message)
                        })?;
                    }
                }

                NodeEvent::Audio => {
                    let audio = self
                        .nodes
                        .get_mut(&current)
                        .expect("current node present")
                        .next_audio();
                    let Some(audio) = audio else {
                        continue;
                    };
                    let value = audio
                        .value_for(self.audio_index)
                        .ok_or(DialogError::MissingAudioIndex(self.audio_index))?
                        .to_string();
                    let (mode, valid, max_time, settings) = {
                        let node = self.nodes.get(&current).expect("current node present");
                        (
                            node.input_mode(),
                            self.interrupt_keys(node),
                            node.max_time_ms(),
                            node.input_settings().cloned(),
                        )
                    };
                    let node_name = self.node_name(current)?;
                    let result = match mode {
                        InputMode::Dtmf => {
                            if max_time == 0 {
                                info!("playing audio; node name = {node_name}");
                            } else {
                                info!(
                                    "playing audio and waiting for dtmf input; node name = {node_name}"
                                );
                            }
                            match audio.source {
                                AudioSource::File => session.play_dtmf(
                                    &value,
                                    &valid,
                                    max_time,
                                    self.delay_after_input_secs,
                                )?,
                                AudioSource::Text => session.say_dtmf(&value, &valid, max_time)?,
                            }
                        }
                        InputMode::Asr => {
                            info!(
                                "playing audio and waiting for asr input; node name = {node_name}"
                            );
                            let settings = asr_settings(settings, max_time)?;
                            match audio.source {
                                AudioSource::File => session.play_asr(&value, &settings)?,
                                AudioSource::Text => session.say_asr(&value, &settings)?,
                            }
                        }
                    };
                    if matches!(result, PromptResult::Dtmf { .. } | PromptResult::Asr { .. }) {
                        // Input arrived during playback: go straight to
                        // option processing.
                        self.nodes
                            .get_mut(&current)
                            .expect("current node present")
                            .set_event(NodeEvent::Option);
                    }
                    pending = result;
                }

                NodeEvent::Option => {
                    let result = std::mem::replace(&mut pending, PromptResult::NoInput);
                    match result {
                        PromptResult::NoInput => self.advance("GOTO")?,
                        PromptResult::Dtmf {
                            digit,
                            barged_in,
                            input_at,
                            ..
                        } => {
                            info!("dtmf input received = {digit}; barge in = {barged_in}");
                            if let Some(history) = &mut self.history {
                                history.set_dtmf_results(&digit, input_at, barged_in);
                            }
                            self.advance(&digit)?;
                            self.last_input = Some(digit);
                        }
                        PromptResult::Asr {
                            utterance,
                            level,
                            score,
                            barged_in,
                            barge_in_frame,
                        } => {
                            self.last_asr_score = Some(score);
                            if let Some(history) = &mut self.history {
                                // The recognizer reports barge-in position
                                // in 20 ms frames.
                                history.set_asr_results(
                                    &utterance,
                                    score,
                                    level,
                                    barged_in,
                                    barge_in_frame * 20,
                                );
                            }
                            match level {
                                ConfidenceLevel::High => {
                                    info!("asr input received = {utterance:?} (high confidence {score})");
                                    self.last_asr_high = Some(true);
                                    self.advance("GOTO")?;
                                }
                                ConfidenceLevel::Low => {
                                    info!("asr input received = {utterance:?} (low confidence {score})");
                                    self.last_asr_high = Some(false);
                                    self.nodes
                                        .get_mut(&current)
                                        .expect("current node present")
                                        .set_event(NodeEvent::Unknown);
                                }
                            }
                            self.last_input = Some(utterance);
                        }
                        PromptResult::Timeout => {
                            self.last_input = None;
                            self.nodes
                                .get_mut(&current)
                                .expect("current node present")
                                .set_event(NodeEvent::Timeout);
                        }
                    }
                }

                NodeEvent::Record => {
                    let record = self
                        .nodes
                        .get_mut(&current)
                        .expect("current node present")
                        .take_record();
                    if let Some(record) = record {
                        info!("recording audio; node name = {}", self.node_name(current)?);
                        let outcome = session.record_audio(&record.to_request())?;
                        if outcome.hash_terminated {
                            info!("recording terminated using # key");
                        }
                        if let Some(history) = &mut self.history {
                            history.set_record_results(
                                outcome.silence_percentage,
                                outcome.hash_terminated,
                            );
                        }
                        self.last_record = Some(outcome);
                    }
                }

                NodeEvent::Unknown => {
                    info!("invalid input received");
                    if let Some(history) = &mut self.history {
                        history.set_is_invalid(true);
                    }
                    self.handle_error_event(current, "UNKNOWN")?;
                }

                NodeEvent::Timeout => {
                    info!("input timeout occurred");
                    if let Some(history) = &mut self.history {
                        history.set_is_timeout(true);
                    }
                    self.handle_error_event(current, "TIMEOUT")?;
                }

                NodeEvent::Reroute => {
                    if let Some(history) = &mut self.history {
                        history.set_is_maxtries(true);
                    }
                    self.advance("REROUTE")?;
                }

                NodeEvent::Exit => {
                    info!("end node reached: node name = {}", self.node_name(current)?);
                    self.dialog_completed = true;
                    return Ok(());
                }
            }
        }
    }

    /// UNKNOWN/TIMEOUT handling: follow the error destination while under
    /// the visit limit, reroute once it is exhausted.
    fn handle_error_event(&mut self, current: NodeKey, token: &str) -> Result<(), DialogError> {
        let (visits, max_visits) = {
            let node = self.nodes.get(&current).expect("current node present");
            (node.visit_count(), node.max_visit_count())
        };
        info!("node visit count = {visits}");
        if visits < max_visits {
            self.advance(token)
        } else {
            self.nodes
                .get_mut(&current)
                .expect("current node present")
                .set_event(NodeEvent::Reroute);
            Ok(())
        }
    }

    /// Resolves `token` on the current node and moves there.
    fn advance(&mut self, token: &str) -> Result<(), DialogError> {
        let now = SystemTime::now();
        let current = self
            .current
            .ok_or_else(|| DialogError::Invalid("no current node".into()))?;

        // Record the visit, collapsing consecutive self-loops so PREVIOUS
        // resolution works.
        if self.visited.last() != Some(&current) {
            self.visited.push(current);
        }

        let dest = {
            let node = self.nodes.get_mut(&current).expect("current node present");
            node.resolve_dest(token, &self.global_opts, &self.visited)
        };

        match dest {
            Some(ResolvedDest::Current) => {
                self.finish_node(current, now);
            }
            Some(ResolvedDest::Previous) => {
                if self.visited.len() < 2 {
                    return Err(DialogError::Invalid(
                        "PREVIOUS destination with no previous node".into(),
                    ));
                }
                self.finish_node(current, now);
                self.current = Some(self.visited[self.visited.len() - 2]);
            }
            Some(ResolvedDest::Node(next)) if self.nodes.contains_key(&next) => {
                info!(
                    "selecting next node for option = {token}; destination node name = {}",
                    self.node_name(next)?
                );
                self.finish_node(current, now);
                self.current = Some(next);
            }
            Some(ResolvedDest::Node(_)) | None => {
                // No (valid) mapping: escalate. Error tokens with no
                // binding would loop forever, so they are hard failures.
                if matches!(token, "UNKNOWN" | "TIMEOUT" | "REROUTE") {
                    return Err(DialogError::Invalid(format!(
                        "node {} has no {token} destination",
                        self.node_name(current)?
                    )));
                }
                self.nodes
                    .get_mut(&current)
                    .expect("current node present")
                    .set_event(NodeEvent::Unknown);
            }
        }

        let next = self.current.expect("current node set");
        let name = self.node_name(next)?;
        if let Some(history) = &mut self.history {
            history.start_node(&name, now);
        }
        Ok(())
    }

    fn finish_node(&mut self, key: NodeKey, now: SystemTime) {
        if let Some(history) = &mut self.history {
            history.end_node(now);
        }
        if let Some(hook) = &mut self.finalize_node {
            if let Some(node) = self.nodes.get(&key) {
                hook(node);
            }
        }
        if let Some(node) = self.nodes.get_mut(&key) {
            node.reset();
        }
    }

    /// Interrupt keys for the current prompt: all digits when the node
    /// accepts any, otherwise the declared node and global options.
    fn interrupt_keys(&self, node: &DialogNode) -> String {
        if node.has_options() {
            if node.use_all_dtmf() {
                ALL_DTMF_DIGITS.to_string()
            } else {
                let mut keys = node.options_string();
                keys.push_str(&self.global_options_string());
                keys
            }
        } else if self.global_opts.is_empty() {
            String::new()
        } else {
            self.global_options_string()
        }
    }

    fn global_options_string(&self) -> String {
        self.global_opts.keys().cloned().collect()
    }

    /// Dumps the per-visit history as a table, for offline inspection.
    pub fn write_stats(&self, path: &Path) -> std::io::Result<()> {
        let Some(history) = &self.history else {
            return Ok(());
        };
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "Session: {}", history.session_id)?;
        writeln!(file, "Start:   {:?}", history.answer_time)?;
        writeln!(file, "End:     {:?}", history.hangup_time)?;
        writeln!(
            file,
            "{:<20} {:<8} {:<24} {:<8} {:<8} {:<8}",
            "Name:", "DTMF:", "ASR:", "Timeout:", "Invalid:", "MaxTries:"
        )?;
        for node in history.nodes() {
            writeln!(
                file,
                "{:<20} {:<8} {:<24} {:<8} {:<8} {:<8}",
                node.name,
                node.dtmf.as_deref().unwrap_or("-"),
                node.asr_utterance.as_deref().unwrap_or("-"),
                node.is_timeout,
                node.is_invalid,
                node.is_maxtries,
            )?;
        }
        Ok(())
    }
}

fn asr_settings(
    settings: Option<InputSettings>,
    recognition_timeout_ms: u32,
) -> Result<AsrSettings, DialogError> {
    match settings {
        Some(InputSettings::Asr {
            barge_in_duration_ms,
            consecutive_speech_duration_ms,
            silence_timeout_ms,
            grammar,
            ..
        }) => Ok(AsrSettings {
            grammar,
            recognition_timeout_ms,
            barge_in_duration_ms,
            consecutive_speech_duration_ms,
            silence_timeout_ms,
        }),
        _ => Err(DialogError::Invalid(
            "asr prompt on a node without asr input settings".into(),
        )),
    }
}

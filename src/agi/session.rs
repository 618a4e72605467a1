//! Synchronous, line-oriented AGI client over a FastAGI TCP connection.
//!
//! Commands are ASCII lines; replies start with a status code. The owning
//! application thread blocks on every exchange. Hangup surfaces as an I/O
//! error or EOF and is mapped to [`AgiError::Hangup`].

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, SystemTime};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, warn};

use crate::agi::response::{AgiError, AgiResponse, ReplyKind, classify, convert_dtmf, parse_success};
use crate::agi::{
    ASR_CONFIDENCE_THRESHOLD, AsrSettings, ConfidenceLevel, HangupStatus, IvrSession, PromptResult,
    RecordingOutcome, RecordingRequest, TransferOutcome,
};
use crate::domain::SessionId;

/// Raw bytes per base64 line of the soundfile transfer sub-protocol.
/// 57 bytes encode to 76 characters.
const SOUNDFILE_CHUNK: usize = 57;

/// Channel variables extracted from the AGI header block.
#[derive(Debug, Clone, Default)]
pub struct AgiEnvironment {
    pub caller_id: Option<String>,
    pub channel: Option<String>,
    pub dnid: Option<String>,
    pub unique_id: String,
    pub dialed_number: Option<String>,
    pub diverted_number: Option<String>,
}

/// Reads the `key: value` header block terminated by a blank line.
pub fn read_environment(reader: &mut impl BufRead) -> Result<AgiEnvironment, AgiError> {
    let mut env = AgiEnvironment::default();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(AgiError::Hangup);
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match key {
            "agi_callerid" => {
                env.caller_id = (value != "unknown").then_some(value);
            }
            "agi_channel" => env.channel = Some(value),
            "agi_dnid" => {
                env.dnid = (value != "unknown").then_some(value);
            }
            "agi_uniqueid" => env.unique_id = value,
            _ => {}
        }
    }
    Ok(env)
}

/// Synchronous AGI client bound to one PBX call leg.
pub struct AgiSession {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    env: AgiEnvironment,
    tts: String,
    speech_server: (String, u16),
    hungup: bool,
}

impl AgiSession {
    /// Wraps an accepted FastAGI connection whose header block has already
    /// been consumed into `env`.
    pub fn new(
        reader: BufReader<TcpStream>,
        writer: TcpStream,
        env: AgiEnvironment,
        tts: String,
        speech_server: (String, u16),
    ) -> Self {
        Self {
            reader,
            writer,
            env,
            tts,
            speech_server,
            hungup: false,
        }
    }

    #[must_use]
    pub fn environment(&self) -> &AgiEnvironment {
        &self.env
    }

    /// Mutable access for callers that restore call context, e.g. the
    /// call-back queue re-attaching the original caller id to a dialed leg.
    pub fn environment_mut(&mut self) -> &mut AgiEnvironment {
        &mut self.env
    }

    /// Reads the dialed (and possibly diverted) number from the channel,
    /// checking for a diversion first.
    pub fn resolve_dialed_number(&mut self) -> Result<(), AgiError> {
        if let Some(redirecting) = self.get_variable("CALLERID(rdnis)")? {
            self.env.dialed_number = Some(redirecting);
            self.env.diverted_number = self.get_variable("CALLERID(dnid)")?;
        } else {
            self.env.dialed_number = self.get_variable("CALLERID(dnid)")?;
        }
        Ok(())
    }

    /// Sends one command line and reads its reply.
    pub fn send_command(&mut self, command: &str) -> Result<AgiResponse, AgiError> {
        let mut line = command.trim().to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()?;
        self.read_reply()
    }

    fn read_line(&mut self) -> Result<String, AgiError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(AgiError::Hangup);
        }
        Ok(line)
    }

    fn read_reply(&mut self) -> Result<AgiResponse, AgiError> {
        let line = self.read_line()?;
        match classify(&line)? {
            (ReplyKind::Success, rest) => parse_success(rest),
            (ReplyKind::InvalidCommand, _) => Err(AgiError::InvalidCommand {
                line: line.trim_end().to_string(),
            }),
            (ReplyKind::SyntaxError, _) => {
                // Drain the usage block bracketed by 520 lines.
                let mut usage = String::new();
                loop {
                    let next = self.read_line()?;
                    if next.starts_with("520") {
                        break;
                    }
                    usage.push_str(&next);
                }
                Err(AgiError::SyntaxError {
                    usage: usage.trim().to_string(),
                })
            }
            (ReplyKind::Failure, _) => Err(AgiError::BadResponse {
                line: line.trim_end().to_string(),
            }),
        }
    }

    /// Answers the channel.
    pub fn answer(&mut self) -> Result<(), AgiError> {
        self.hungup = false;
        self.send_command("ANSWER")?;
        Ok(())
    }

    /// Ends the session, reporting `status` through the AGISTATUS variable.
    /// No other method should be called afterwards.
    pub fn hangup(&mut self, status: HangupStatus) -> Result<(), AgiError> {
        if self.hungup {
            return Ok(());
        }
        self.set_variable("AGISTATUS", status.as_str())?;
        self.hungup = true;
        Ok(())
    }

    /// Runs a non-AGI dialplan application.
    pub fn execute(&mut self, command: &str) -> Result<AgiResponse, AgiError> {
        self.send_command(&format!("EXEC {command}"))
    }

    fn format_tts(&self, text: &str) -> String {
        let cleaned = text.replace('\n', " ").replace('"', "");
        format!("EXEC {} \"{}\"", self.tts, cleaned)
    }

    /// Says `text` through the configured TTS engine, uninterruptible.
    pub fn say(&mut self, text: &str) -> Result<i64, AgiError> {
        Ok(self.send_command(&self.format_tts(text))?.result)
    }

    /// Same as [`Self::say`] but with interrupt keys; returns the DTMF code
    /// pressed, or 0.
    pub fn say_control(&mut self, text: &str, interrupt_keys: &str) -> Result<i64, AgiError> {
        let command = format!("{}|{}", self.format_tts(text), interrupt_keys);
        Ok(self.send_command(&command)?.result)
    }

    /// Streams an audio file, uninterruptible.
    pub fn play_audio(&mut self, filename: &str) -> Result<i64, AgiError> {
        self.play_audio_control(filename, "")
    }

    /// Streams an audio file with interrupt keys. Returns the DTMF code
    /// pressed, 0 for none, negative on playback failure.
    pub fn play_audio_control(
        &mut self,
        filename: &str,
        interrupt_keys: &str,
    ) -> Result<i64, AgiError> {
        // The PBX expects the name without its extension.
        let name = match filename.rfind('.') {
            Some(dot) => &filename[..dot],
            None => filename,
        };
        let keys = if interrupt_keys.is_empty() {
            "\"\""
        } else {
            interrupt_keys
        };
        Ok(self
            .send_command(&format!("STREAM FILE {name} {keys}"))?
            .result)
    }

    /// Plays an audio file, falling back to TTS of `text` on failure.
    pub fn play_audio_tts(&mut self, filename: &str, text: &str) -> Result<i64, AgiError> {
        let result = self.play_audio(filename)?;
        if result < 0 {
            return self.say(text);
        }
        Ok(result)
    }

    /// Interruptible variant of [`Self::play_audio_tts`].
    pub fn play_audio_tts_control(
        &mut self,
        filename: &str,
        text: &str,
        interrupt_keys: &str,
    ) -> Result<i64, AgiError> {
        let result = self.play_audio_control(filename, interrupt_keys)?;
        if result < 0 {
            return self.say_control(text, interrupt_keys);
        }
        Ok(result)
    }

    /// Renders text to an audio file via TTS without playing it. Only the
    /// `tts` application supports buffered rendering.
    pub fn render_text(&mut self, text: &str) -> Result<String, AgiError> {
        if self.tts.to_lowercase() != "tts" {
            return Err(AgiError::InvalidCommand {
                line: format!(
                    "buffered rendering requires the tts application, have {:?}",
                    self.tts
                ),
            });
        }
        let command = format!("{}|bufferonly", self.format_tts(text));
        if self.send_command(&command)?.result < 0 {
            return Err(AgiError::ExecuteFailed("tts rendering failed".into()));
        }
        let filename = self
            .get_variable("TTS_FILENAME")?
            .ok_or_else(|| AgiError::ExecuteFailed("tts did not set TTS_FILENAME".into()))?;
        Ok(format!("{filename}.ulaw"))
    }

    /// TTS prompt expecting DTMF input.
    pub fn say_dtmf(
        &mut self,
        text: &str,
        valid: &str,
        max_timeout_ms: u32,
    ) -> Result<PromptResult, AgiError> {
        let prompt = self.render_text(text)?;
        self.dtmf_prompt(&prompt, valid, max_timeout_ms, 0)
    }

    /// Audio-file prompt expecting DTMF input.
    pub fn play_dtmf(
        &mut self,
        filename: &str,
        valid: &str,
        max_timeout_ms: u32,
        delay_after_input_secs: u64,
    ) -> Result<PromptResult, AgiError> {
        self.dtmf_prompt(filename, valid, max_timeout_ms, delay_after_input_secs)
    }

    fn dtmf_prompt(
        &mut self,
        filename: &str,
        valid: &str,
        max_timeout_ms: u32,
        delay_after_input_secs: u64,
    ) -> Result<PromptResult, AgiError> {
        let result = self.play_audio_control(filename, valid)?;
        let playback_stopped_at = SystemTime::now();
        if result < 0 {
            return Err(AgiError::InputFailed);
        }
        if result > 0 {
            // Barge-in during playback.
            thread::sleep(Duration::from_secs(delay_after_input_secs));
            return Ok(PromptResult::Dtmf {
                digit: convert_dtmf(result),
                barged_in: true,
                input_at: playback_stopped_at,
                playback_stopped_at,
            });
        }
        if max_timeout_ms == 0 {
            return Ok(PromptResult::NoInput);
        }
        let waited = self.get_input(max_timeout_ms)?;
        if waited < 0 {
            return Err(AgiError::InputFailed);
        }
        if waited == 0 {
            return Ok(PromptResult::Timeout);
        }
        let input_at = SystemTime::now();
        thread::sleep(Duration::from_secs(delay_after_input_secs));
        Ok(PromptResult::Dtmf {
            digit: convert_dtmf(waited),
            barged_in: false,
            input_at,
            playback_stopped_at,
        })
    }

    /// Audio-file prompt feeding the speech recognizer.
    pub fn play_asr(
        &mut self,
        filename: &str,
        settings: &AsrSettings,
    ) -> Result<PromptResult, AgiError> {
        self.recognize_speech(filename, settings)
    }

    /// TTS prompt feeding the speech recognizer.
    pub fn say_asr(&mut self, text: &str, settings: &AsrSettings) -> Result<PromptResult, AgiError> {
        let prompt = self.render_text(text)?;
        self.recognize_speech(&prompt, settings)
    }

    fn recognize_speech(
        &mut self,
        prompt_filename: &str,
        settings: &AsrSettings,
    ) -> Result<PromptResult, AgiError> {
        let name = match prompt_filename.rfind('.') {
            Some(dot) => &prompt_filename[..dot],
            None => prompt_filename,
        };
        let (host, port) = &self.speech_server;
        let command = format!(
            "EXEC recognizer {name}|{}|{host}:{port}|{}|{}|{}|{}",
            settings.barge_in_duration_ms,
            settings.grammar,
            settings.recognition_timeout_ms,
            settings.consecutive_speech_duration_ms,
            settings.silence_timeout_ms,
        );
        if self.send_command(&command)?.result < 0 {
            return Err(AgiError::ExecuteFailed(
                "recognizer failed; check the ASR server, audio file and grammar name".into(),
            ));
        }

        let raw = self.get_variable("RECOGNITION_RESULTS")?.unwrap_or_default();
        let utterance = strip_silence_tokens(&raw);
        let score: f64 = self
            .get_variable("RECOGNITION_CONFIDENCE")?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let barged_in = self.get_variable("RECOGNITION_BARGIN")?.as_deref() == Some("1");
        let barge_in_frame: u32 = self
            .get_variable("RECOGNITION_BARGINFRAME")?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        if utterance.is_empty() {
            return Ok(PromptResult::Timeout);
        }
        let level = if score > ASR_CONFIDENCE_THRESHOLD {
            ConfidenceLevel::High
        } else {
            ConfidenceLevel::Low
        };
        Ok(PromptResult::Asr {
            utterance,
            level,
            score,
            barged_in,
            barge_in_frame,
        })
    }

    /// Records a clip on the PBX and fetches it back over the wire.
    pub fn record_audio(
        &mut self,
        request: &RecordingRequest,
    ) -> Result<RecordingOutcome, AgiError> {
        let (name, format) = match request.filename.rfind('.') {
            Some(dot) => (&request.filename[..dot], &request.filename[dot + 1..]),
            None => (request.filename.as_str(), "wav"),
        };
        let keys = if request.interrupt_keys.is_empty() {
            "\"\""
        } else {
            &request.interrupt_keys
        };

        let (result, silence_percentage, hash_terminated) = if request.custom_silence_detection {
            let quiet = if request.play_beep { "" } else { "|q" };
            let command = format!(
                "EXEC RecordSD {name}.{format}|{}|{}{quiet}",
                request
                    .silence_timeout_secs
                    .map_or_else(|| "0".to_string(), |s| s.to_string()),
                request.max_time_ms,
            );
            let result = self.send_command(&command)?.result;
            let silence = self
                .get_variable("SILENCE_PERCENTAGE")?
                .and_then(|s| s.parse().ok());
            let hash = self.get_variable("HASH_TERMINATION")?.as_deref() == Some("1");
            (result, silence, hash)
        } else {
            let beep = if request.play_beep { " beep" } else { "" };
            let silence = request
                .silence_timeout_secs
                .map_or_else(String::new, |s| format!(" s={s}"));
            let command = format!(
                "RECORD FILE {name} {format} {keys} {}{beep}{silence}",
                request.max_time_ms
            );
            (self.send_command(&command)?.result, None, false)
        };
        if result != 0 {
            return Err(AgiError::ExecuteFailed(format!(
                "recording failed with result {result}"
            )));
        }

        self.get_audio_file(&request.filename)?;
        Ok(RecordingOutcome {
            local_path: request.filename.clone(),
            silence_percentage,
            hash_terminated,
        })
    }

    /// Bridges the caller to `number` via the PBX Dial application.
    pub fn transfer(
        &mut self,
        number: &str,
        dial_timeout_ms: Option<u32>,
        announcement_filename: Option<&str>,
        ringing: bool,
    ) -> Result<TransferOutcome, AgiError> {
        let timeout = dial_timeout_ms.map_or_else(String::new, |ms| format!("|{}", ms / 1000));
        let ring = if ringing { "|r" } else { "" };
        let announce =
            announcement_filename.map_or_else(String::new, |file| format!("A({file})"));
        self.send_command(&format!("EXEC Dial {number}{timeout}{ring}|m(){announce}"))?;

        let status = self.get_variable("DIALSTATUS")?.unwrap_or_default();
        let bridged_millis = match self.get_variable("ANSWEREDTIME")? {
            Some(seconds) => seconds.parse::<i64>().map_or(-1, |s| s * 1000),
            None => -1,
        };
        Ok(TransferOutcome {
            status,
            bridged_millis,
        })
    }

    /// Whether the channel is still up (`CHANNEL STATUS` 6 is "up").
    pub fn channel_is_active(&mut self) -> Result<bool, AgiError> {
        Ok(self.send_command("CHANNEL STATUS")?.result == 6)
    }

    /// Waits up to `timeout_ms` for one DTMF digit. Returns the digit code,
    /// 0 if none arrived, negative on failure.
    pub fn get_input(&mut self, timeout_ms: u32) -> Result<i64, AgiError> {
        Ok(self
            .send_command(&format!("WAIT FOR DIGIT {timeout_ms}"))?
            .result)
    }

    /// Prompts for a DTMF string terminated by `#` or `max_digits`.
    pub fn get_input_string(
        &mut self,
        max_digits: u32,
        timeout_secs: u32,
        delay_after_input_secs: u64,
        audio_filename: &str,
    ) -> Result<Option<String>, AgiError> {
        self.send_command(&format!(
            "EXEC Read \"InputString|{audio_filename}|{max_digits}|||{timeout_secs}\""
        ))?;
        let value = self.get_variable("InputString")?;
        thread::sleep(Duration::from_secs(delay_after_input_secs));
        Ok(value)
    }

    /// Prints a message on the PBX CLI console.
    pub fn message(&mut self, text: &str) -> Result<(), AgiError> {
        self.send_command(&format!("EXEC NOOP {text}"))?;
        Ok(())
    }

    /// Sets a channel variable.
    pub fn set_variable(&mut self, name: &str, value: &str) -> Result<(), AgiError> {
        self.send_command(&format!("SET VARIABLE {name} {value}"))?;
        Ok(())
    }

    /// Reads a channel variable; dialplan expressions use the FULL form.
    pub fn get_variable(&mut self, name: &str) -> Result<Option<String>, AgiError> {
        let command = if name.starts_with('$') {
            "GET FULL VARIABLE"
        } else {
            "GET VARIABLE"
        };
        let response = self.send_command(&format!("{command} {name}"))?;
        if response.result == 1 {
            Ok(response.value.filter(|v| !v.is_empty()))
        } else {
            Ok(None)
        }
    }

    /// Pushes a local sound file to the PBX via the file-transfer adjunct.
    pub fn send_audio_file(&mut self, filename: &str) -> Result<(), AgiError> {
        let data = fs::read(filename)?;
        let response =
            self.send_command(&format!("PUT SOUNDFILE {filename} {}", data.len()))?;
        if response.result != 0 {
            return Err(AgiError::ExecuteFailed(format!(
                "PUT SOUNDFILE refused with result {}",
                response.result
            )));
        }
        for chunk in data.chunks(SOUNDFILE_CHUNK) {
            let mut line = BASE64.encode(chunk);
            line.push('\n');
            self.writer.write_all(line.as_bytes())?;
        }
        self.writer.flush()?;
        let done = self.read_reply()?;
        if done.result != 0 {
            return Err(AgiError::ExecuteFailed(format!(
                "soundfile upload failed with result {}",
                done.result
            )));
        }
        Ok(())
    }

    /// Fetches a sound file from the PBX via the file-transfer adjunct.
    pub fn get_audio_file(&mut self, filename: &str) -> Result<(), AgiError> {
        let response = match self.send_command(&format!("GET SOUNDFILE {filename}")) {
            Ok(response) => response,
            Err(AgiError::InvalidCommand { line }) => {
                // The transfer addon is not installed; the file must already
                // be local to the PBX host.
                warn!("soundfile transfer unavailable: {line}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if response.result != 0 {
            return Err(AgiError::ExecuteFailed(format!(
                "GET SOUNDFILE refused with result {}",
                response.result
            )));
        }
        let size: usize = response
            .value
            .as_deref()
            .and_then(|v| v.rsplit("size=").next())
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| AgiError::BadResponse {
                line: "GET SOUNDFILE reply carried no size".into(),
            })?;

        let mut data = Vec::with_capacity(size);
        while data.len() < size {
            let line = self.read_line()?;
            if line.starts_with("200") {
                return Err(AgiError::ExecuteFailed(
                    "soundfile download aborted by the PBX".into(),
                ));
            }
            let decoded = BASE64
                .decode(line.trim_end())
                .map_err(|_| AgiError::BadResponse {
                    line: "soundfile chunk is not base64".into(),
                })?;
            data.extend_from_slice(&decoded);
        }
        fs::write(filename, &data)?;
        debug!("fetched {filename} ({size} bytes) from the pbx");
        Ok(())
    }
}

impl IvrSession for AgiSession {
    fn caller_id(&self) -> Option<String> {
        self.env.caller_id.clone()
    }

    fn dialed_number(&self) -> Option<String> {
        self.env.dialed_number.clone()
    }

    fn session_id(&self) -> SessionId {
        SessionId::try_new(self.env.unique_id.clone())
            .unwrap_or_else(|_| SessionId::try_new("unknown-session".to_string()).expect("non-empty"))
    }

    fn play_dtmf(
        &mut self,
        filename: &str,
        valid: &str,
        max_timeout_ms: u32,
        delay_after_input_secs: u64,
    ) -> Result<PromptResult, AgiError> {
        AgiSession::play_dtmf(self, filename, valid, max_timeout_ms, delay_after_input_secs)
    }

    fn say_dtmf(
        &mut self,
        text: &str,
        valid: &str,
        max_timeout_ms: u32,
    ) -> Result<PromptResult, AgiError> {
        AgiSession::say_dtmf(self, text, valid, max_timeout_ms)
    }

    fn play_asr(
        &mut self,
        filename: &str,
        settings: &AsrSettings,
    ) -> Result<PromptResult, AgiError> {
        AgiSession::play_asr(self, filename, settings)
    }

    fn say_asr(&mut self, text: &str, settings: &AsrSettings) -> Result<PromptResult, AgiError> {
        AgiSession::say_asr(self, text, settings)
    }

    fn record_audio(&mut self, request: &RecordingRequest) -> Result<RecordingOutcome, AgiError> {
        AgiSession::record_audio(self, request)
    }

    fn hangup(&mut self, status: HangupStatus) -> Result<(), AgiError> {
        AgiSession::hangup(self, status)
    }
}

/// Strips recognizer silence/bracket tokens from an utterance.
fn strip_silence_tokens(raw: &str) -> String {
    raw.split_whitespace()
        .filter(|token| {
            !matches!(
                *token,
                "SILN" | "_SILN" | "SIL" | "SENT-START" | "SENT-END" | "SIL-ENCE" | "-ENCE"
            )
        })
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_tokens_are_stripped() {
        assert_eq!(strip_silence_tokens("SIL one two SILN"), "one two");
        assert_eq!(strip_silence_tokens("SENT-START yes SENT-END"), "yes");
        assert_eq!(strip_silence_tokens("SIL"), "");
        assert_eq!(strip_silence_tokens("transfer me"), "transfer me");
    }

    #[test]
    fn environment_parses_header_block() {
        let header = "agi_network: yes\nagi_callerid: 2772001\nagi_channel: SIP/100-1\n\
                      agi_dnid: 900\nagi_uniqueid: 1700000000.42\n\n";
        let mut reader = std::io::BufReader::new(header.as_bytes());
        let env = read_environment(&mut reader).unwrap();
        assert_eq!(env.caller_id.as_deref(), Some("2772001"));
        assert_eq!(env.channel.as_deref(), Some("SIP/100-1"));
        assert_eq!(env.dnid.as_deref(), Some("900"));
        assert_eq!(env.unique_id, "1700000000.42");
    }

    #[test]
    fn unknown_caller_id_reads_as_none() {
        let header = "agi_callerid: unknown\nagi_uniqueid: 1.2\n\n";
        let mut reader = std::io::BufReader::new(header.as_bytes());
        let env = read_environment(&mut reader).unwrap();
        assert!(env.caller_id.is_none());
    }

    #[test]
    fn truncated_header_is_a_hangup() {
        let mut reader = std::io::BufReader::new("agi_channel: SIP/1".as_bytes());
        assert!(matches!(
            read_environment(&mut reader),
            Err(AgiError::Hangup)
        ));
    }
}

//! Parser for AGI reply lines.
//!
//! Replies are ASCII lines starting with a status code. Success lines carry
//! `result=<int>` plus an optional suffix: an `endpos=` marker for playback
//! commands, or a parenthesised value for variable reads. Bad lines are
//! carried in the error variant instead of driving control flow.

use thiserror::Error;

/// Result value standing in for a failed command where the protocol only
/// gives us `200 result=0 endpos=0`.
pub const PLAYBACK_FAILED: i64 = -3;

/// Errors raised by the AGI client.
#[derive(Debug, Error)]
pub enum AgiError {
    #[error("agi i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// The PBX closed the channel; the only normal termination.
    #[error("channel hung up")]
    Hangup,

    /// `510` — the PBX does not know this command.
    #[error("invalid agi command: {line}")]
    InvalidCommand { line: String },

    /// `520 … 520` — bad syntax; the usage block is preserved.
    #[error("agi syntax error: {usage}")]
    SyntaxError { usage: String },

    /// A reply line that fits no known shape.
    #[error("malformed agi reply: {line}")]
    BadResponse { line: String },

    /// A PBX-side application (TTS, recognizer) reported failure.
    #[error("pbx application failed: {0}")]
    ExecuteFailed(String),

    /// Input retrieval failed mid-prompt, usually because the caller hung
    /// up during playback.
    #[error("failed to retrieve input (possible hangup)")]
    InputFailed,
}

/// One parsed `200` reply.
#[derive(Debug, Clone, PartialEq)]
pub struct AgiResponse {
    /// The `result=` integer, with the endpos failure rule applied.
    pub result: i64,
    /// `endpos=` suffix when present.
    pub endpos: Option<i64>,
    /// Parenthesised value when present, brackets stripped.
    pub value: Option<String>,
}

impl AgiResponse {
    #[must_use]
    pub fn ok(&self) -> bool {
        self.result >= 0
    }
}

/// Classifies the first line of a reply.
#[derive(Debug, PartialEq, Eq)]
pub enum ReplyKind {
    Success,
    InvalidCommand,
    SyntaxError,
    Failure,
}

/// Splits a reply line into its status code and remainder. The code may be
/// followed by a space or, for syntax-error blocks, a dash.
pub fn classify(line: &str) -> Result<(ReplyKind, &str), AgiError> {
    let trimmed = line.trim_end();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    if digits_end == 0 {
        return Err(AgiError::BadResponse {
            line: trimmed.to_string(),
        });
    }
    let code: u16 = trimmed[..digits_end].parse().map_err(|_| AgiError::BadResponse {
        line: trimmed.to_string(),
    })?;
    let rest = trimmed[digits_end..].trim_start_matches([' ', '-']);
    let kind = match code {
        200 => ReplyKind::Success,
        510 => ReplyKind::InvalidCommand,
        520 => ReplyKind::SyntaxError,
        _ => ReplyKind::Failure,
    };
    Ok((kind, rest))
}

/// Parses the remainder of a `200` line.
///
/// Playback success is `result != 0` OR `endpos > 0`; both zero collapse to
/// [`PLAYBACK_FAILED`] because the PBX reports 200 even when the file was
/// not found.
pub fn parse_success(rest: &str) -> Result<AgiResponse, AgiError> {
    let rest = rest.trim();
    let Some(after) = rest.strip_prefix("result=") else {
        // A 200 with no result marker reads as a zero result.
        return Ok(AgiResponse {
            result: 0,
            endpos: None,
            value: None,
        });
    };

    let (result_text, suffix) = after
        .split_once(' ')
        .map_or((after, None), |(head, tail)| (head, Some(tail.trim())));
    let result: i64 = result_text.parse().map_err(|_| AgiError::BadResponse {
        line: format!("result={after}"),
    })?;

    let mut endpos = None;
    let mut value = None;
    if let Some(suffix) = suffix {
        if let Some(endpos_text) = suffix.strip_prefix("endpos=") {
            endpos = Some(endpos_text.trim().parse().map_err(|_| {
                AgiError::BadResponse {
                    line: format!("result={after}"),
                }
            })?);
        } else if suffix.starts_with('(') {
            value = Some(
                suffix
                    .trim_start_matches('(')
                    .trim_end_matches(')')
                    .to_string(),
            );
        } else {
            // Compound suffix carrying another integer code; keep the text.
            value = Some(suffix.to_string());
        }
    }

    let result = match endpos {
        Some(0) if result == 0 => PLAYBACK_FAILED,
        _ => result,
    };
    Ok(AgiResponse {
        result,
        endpos,
        value,
    })
}

/// Converts the PBX DTMF result code into the digit it stands for.
///
/// `42` is asterisk, `35` is hash, `0` is the zero key; everything else is
/// offset by the ASCII code of `'0'`.
#[must_use]
pub fn convert_dtmf(code: i64) -> String {
    match code {
        42 => "*".to_string(),
        35 => "#".to_string(),
        0 => "0".to_string(),
        other => (other - 48).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_codes() {
        assert_eq!(classify("200 result=1").unwrap().0, ReplyKind::Success);
        assert_eq!(
            classify("510 Invalid or unknown command").unwrap().0,
            ReplyKind::InvalidCommand
        );
        let (kind, rest) = classify("520-Invalid command syntax.").unwrap();
        assert_eq!(kind, ReplyKind::SyntaxError);
        assert_eq!(rest, "Invalid command syntax.");
        assert_eq!(classify("520 usage").unwrap().0, ReplyKind::SyntaxError);
        assert_eq!(classify("404 huh").unwrap().0, ReplyKind::Failure);
        assert!(classify("garbage").is_err());
    }

    #[test]
    fn parses_plain_results() {
        let response = parse_success("result=49").unwrap();
        assert_eq!(response.result, 49);
        assert_eq!(response.endpos, None);
        assert_eq!(response.value, None);
    }

    #[test]
    fn endpos_zero_zero_is_playback_failure() {
        let failed = parse_success("result=0 endpos=0").unwrap();
        assert_eq!(failed.result, PLAYBACK_FAILED);

        let played = parse_success("result=0 endpos=23423").unwrap();
        assert_eq!(played.result, 0);
        assert_eq!(played.endpos, Some(23423));

        let interrupted = parse_success("result=49 endpos=800").unwrap();
        assert_eq!(interrupted.result, 49);
    }

    #[test]
    fn parses_quoted_variable_values() {
        let response = parse_success("result=1 (SIP/100-00000abc)").unwrap();
        assert_eq!(response.result, 1);
        assert_eq!(response.value.as_deref(), Some("SIP/100-00000abc"));
    }

    #[test]
    fn negative_results_parse() {
        assert_eq!(parse_success("result=-1").unwrap().result, -1);
    }

    #[test]
    fn rubbish_result_is_a_bad_response() {
        assert!(matches!(
            parse_success("result=banana"),
            Err(AgiError::BadResponse { .. })
        ));
    }

    #[test]
    fn dtmf_codes_convert() {
        assert_eq!(convert_dtmf(42), "*");
        assert_eq!(convert_dtmf(35), "#");
        assert_eq!(convert_dtmf(0), "0");
        assert_eq!(convert_dtmf(49), "1");
        assert_eq!(convert_dtmf(57), "9");
    }
}

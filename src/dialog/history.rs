//! Structured per-call history: one record per node visit, closed out when
//! the call ends.

use std::collections::HashMap;
use std::time::SystemTime;

use serde::Serialize;

use crate::agi::ConfidenceLevel;

/// One node visit.
#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub name: String,
    #[serde(skip)]
    pub start_time: Option<SystemTime>,
    #[serde(skip)]
    pub end_time: Option<SystemTime>,
    pub dtmf: Option<String>,
    #[serde(skip)]
    pub dtmf_time: Option<SystemTime>,
    pub dtmf_barged_in: Option<bool>,
    pub asr_utterance: Option<String>,
    pub asr_score: Option<f64>,
    #[serde(skip)]
    pub asr_level: Option<ConfidenceLevel>,
    pub asr_barged_in: Option<bool>,
    pub asr_barge_in_ms: Option<u32>,
    pub record_silence_percentage: Option<f64>,
    pub record_hash_terminated: Option<bool>,
    pub is_timeout: bool,
    pub is_invalid: bool,
    pub is_maxtries: bool,
    pub custom: Option<HashMap<String, String>>,
}

impl NodeRecord {
    fn empty() -> Self {
        Self {
            name: String::new(),
            start_time: None,
            end_time: None,
            dtmf: None,
            dtmf_time: None,
            dtmf_barged_in: None,
            asr_utterance: None,
            asr_score: None,
            asr_level: None,
            asr_barged_in: None,
            asr_barge_in_ms: None,
            record_silence_percentage: None,
            record_hash_terminated: None,
            is_timeout: false,
            is_invalid: false,
            is_maxtries: false,
            custom: None,
        }
    }
}

/// Append-only record of one call.
#[derive(Debug)]
pub struct CallHistory {
    pub session_id: String,
    pub answer_time: SystemTime,
    pub caller_number: Option<String>,
    pub dialed_number: Option<String>,
    pub hangup_time: Option<SystemTime>,
    nodes: Vec<NodeRecord>,
    current: NodeRecord,
}

impl CallHistory {
    #[must_use]
    pub fn new(
        session_id: String,
        answer_time: SystemTime,
        caller_number: Option<String>,
        dialed_number: Option<String>,
    ) -> Self {
        Self {
            session_id,
            answer_time,
            caller_number,
            dialed_number,
            hangup_time: None,
            nodes: Vec::new(),
            current: NodeRecord::empty(),
        }
    }

    /// Opens the record for a new node visit.
    pub fn start_node(&mut self, name: &str, start_time: SystemTime) {
        self.current.name = name.to_string();
        self.current.start_time = Some(start_time);
    }

    pub fn set_dtmf_results(&mut self, digit: &str, time: SystemTime, barged_in: bool) {
        self.current.dtmf = Some(digit.to_string());
        self.current.dtmf_time = Some(time);
        self.current.dtmf_barged_in = Some(barged_in);
    }

    pub fn set_asr_results(
        &mut self,
        utterance: &str,
        score: f64,
        level: ConfidenceLevel,
        barged_in: bool,
        barge_in_ms: u32,
    ) {
        self.current.asr_utterance = Some(utterance.to_string());
        self.current.asr_score = Some(score);
        self.current.asr_level = Some(level);
        self.current.asr_barged_in = Some(barged_in);
        self.current.asr_barge_in_ms = Some(barge_in_ms);
    }

    pub fn set_record_results(
        &mut self,
        silence_percentage: Option<f64>,
        hash_terminated: bool,
    ) {
        self.current.record_silence_percentage = silence_percentage;
        self.current.record_hash_terminated = Some(hash_terminated);
    }

    pub fn set_is_timeout(&mut self, is_timeout: bool) {
        self.current.is_timeout = is_timeout;
    }

    pub fn set_is_invalid(&mut self, is_invalid: bool) {
        self.current.is_invalid = is_invalid;
    }

    pub fn set_is_maxtries(&mut self, is_maxtries: bool) {
        self.current.is_maxtries = is_maxtries;
    }

    /// Attaches application-defined data to the current visit.
    pub fn set_custom(&mut self, custom: HashMap<String, String>) {
        self.current.custom = Some(custom);
    }

    /// Closes the current visit and appends it.
    pub fn end_node(&mut self, end_time: SystemTime) {
        let mut finished = std::mem::replace(&mut self.current, NodeRecord::empty());
        finished.end_time = Some(end_time);
        self.nodes.push(finished);
    }

    pub fn set_hangup_time(&mut self, hangup_time: SystemTime) {
        self.hangup_time = Some(hangup_time);
    }

    #[must_use]
    pub fn nodes(&self) -> &[NodeRecord] {
        &self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visits_accumulate_in_order() {
        let now = SystemTime::now();
        let mut history =
            CallHistory::new("1.42".into(), now, Some("2772001".into()), Some("900".into()));

        history.start_node("start", now);
        history.set_dtmf_results("2", now, true);
        history.end_node(now);

        history.start_node("end", now);
        history.set_is_timeout(true);
        history.end_node(now);
        history.set_hangup_time(now);

        let nodes = history.nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "start");
        assert_eq!(nodes[0].dtmf.as_deref(), Some("2"));
        assert_eq!(nodes[0].dtmf_barged_in, Some(true));
        assert!(!nodes[0].is_timeout);
        assert_eq!(nodes[1].name, "end");
        assert!(nodes[1].is_timeout);
        assert!(nodes[1].dtmf.is_none(), "attributes reset between visits");
        assert!(history.hangup_time.is_some());
    }

    #[test]
    fn custom_data_attaches_to_the_open_visit() {
        let now = SystemTime::now();
        let mut history = CallHistory::new("1.43".into(), now, None, None);
        history.start_node("lookup", now);
        history.set_custom(HashMap::from([("balance".to_string(), "42".to_string())]));
        history.end_node(now);
        assert_eq!(
            history.nodes()[0].custom.as_ref().unwrap().get("balance"),
            Some(&"42".to_string())
        );
    }
}

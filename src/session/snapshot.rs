use crate::audio::ConnectionQuality;
use crate::error::ErrorInfo;
use crate::negotiation::{ConnectionState, TransportQuality};
use crate::pipeline::PipelineSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Oldest turns are dropped past this many
pub const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    /// Still being transcribed; replaced in place until final
    InterimUser,
    Assistant,
}

/// A single entry of the conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationTurn {
    pub speaker: Speaker,
    pub text: String,
    pub confidence: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversationHistory {
    turns: VecDeque<ConversationTurn>,
}

impl ConversationHistory {
    pub fn turns(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Update the pending interim turn, or open one. A final transcript
    /// turns it into a user turn.
    pub fn transcript(&mut self, text: &str, is_final: bool, confidence: Option<f32>) {
        if text.trim().is_empty() {
            return;
        }

        let speaker = if is_final {
            Speaker::User
        } else {
            Speaker::InterimUser
        };

        if let Some(turn) = self
            .turns
            .iter_mut()
            .rev()
            .find(|t| t.speaker == Speaker::InterimUser)
        {
            turn.speaker = speaker;
            turn.text = text.to_string();
            turn.confidence = confidence;
            turn.timestamp = Utc::now();
            return;
        }

        if is_final && self.last_is(Speaker::User, text) {
            return;
        }
        self.push(speaker, text, confidence);
    }

    /// Record an assistant reply, skipping an exact repeat of the last turn
    pub fn assistant(&mut self, text: &str) {
        if text.trim().is_empty() || self.last_is(Speaker::Assistant, text) {
            return;
        }
        self.push(Speaker::Assistant, text, None);
    }

    fn last_is(&self, speaker: Speaker, text: &str) -> bool {
        self.turns
            .back()
            .map(|t| t.speaker == speaker && t.text == text)
            .unwrap_or(false)
    }

    fn push(&mut self, speaker: Speaker, text: &str, confidence: Option<f32>) {
        self.turns.push_back(ConversationTurn {
            speaker,
            text: text.to_string(),
            confidence,
            timestamp: Utc::now(),
        });
        while self.turns.len() > HISTORY_LIMIT {
            self.turns.pop_front();
        }
    }
}

/// Everything a UI needs, published on every change
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub connection_state: ConnectionState,
    pub pipeline: PipelineSnapshot,
    /// Latest voice-activity level, 0-100
    pub audio_level: f32,
    pub quality: Option<ConnectionQuality>,
    pub transport: Option<TransportQuality>,
    pub transcript: String,
    pub interim_transcript: String,
    pub ai_response: Option<String>,
    pub history: ConversationHistory,
    pub error: Option<ErrorInfo>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            session_id: None,
            created_at: None,
            is_active: false,
            connection_state: ConnectionState::Disconnected,
            pipeline: PipelineSnapshot::default(),
            audio_level: 0.0,
            quality: None,
            transport: None,
            transcript: String::new(),
            interim_transcript: String::new(),
            ai_response: None,
            history: ConversationHistory::default(),
            error: None,
        }
    }
}

impl SessionSnapshot {
    /// Native transport quality when sampled, else the level heuristic while connected
    pub(crate) fn refresh_quality(&mut self) {
        self.quality = match (&self.transport, self.connection_state) {
            (Some(t), _) => Some(t.quality),
            (None, ConnectionState::Connected) => {
                Some(ConnectionQuality::from_level(self.audio_level))
            }
            (None, _) => None,
        };
    }

    /// Transcript to hand the LLM: the final one, else whatever is interim
    pub fn best_transcript(&self) -> &str {
        if self.transcript.trim().is_empty() {
            &self.interim_transcript
        } else {
            &self.transcript
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interim_turn_is_replaced_then_finalized() {
        let mut history = ConversationHistory::default();
        history.transcript("hel", false, None);
        history.transcript("hello", false, None);
        assert_eq!(history.len(), 1);

        history.transcript("hello there", true, Some(0.9));
        let turns: Vec<_> = history.turns().collect();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].speaker, Speaker::User);
        assert_eq!(turns[0].text, "hello there");
    }

    #[test]
    fn duplicates_and_blanks_are_skipped() {
        let mut history = ConversationHistory::default();
        history.transcript("hi", true, None);
        history.transcript("hi", true, None);
        history.assistant("hello");
        history.assistant("hello");
        history.assistant("   ");
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn history_is_bounded() {
        let mut history = ConversationHistory::default();
        for i in 0..HISTORY_LIMIT + 10 {
            history.assistant(&format!("reply {}", i));
        }
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(
            history.turns().next().map(|t| t.text.as_str()),
            Some("reply 10")
        );
    }

    #[test]
    fn quality_prefers_transport_samples() {
        let mut snapshot = SessionSnapshot {
            audio_level: 60.0,
            ..Default::default()
        };
        snapshot.refresh_quality();
        assert_eq!(snapshot.quality, None);

        snapshot.connection_state = ConnectionState::Connected;
        snapshot.refresh_quality();
        assert_eq!(snapshot.quality, Some(ConnectionQuality::Excellent));
    }
}

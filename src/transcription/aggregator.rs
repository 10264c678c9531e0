//! # Transcription Aggregator
//!
//! Accumulates the streamed transcripts of one conversational turn and
//! finalizes them into the conversation history.
//!
//! ## Turn Lifecycle:
//! 1. Input fragments (what the user said) append to the input buffer
//! 2. Output fragments (what the assistant said) append to the output buffer
//! 3. On turn-complete both buffers become two history lines and are cleared
//!
//! A turn that completes with nothing transcribed still produces both lines.

use serde::Serialize;

/// The two history lines produced by one completed turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedTurn {
    pub user: String,
    pub assistant: String,
}

#[derive(Debug, Default, Clone)]
pub struct TranscriptionAggregator {
    input: String,
    output: String,
    history: Vec<String>,
}

impl TranscriptionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment of the user's speech. Returns the buffer so far.
    pub fn append_input(&mut self, fragment: &str) -> &str {
        self.input.push_str(fragment);
        &self.input
    }

    /// Append a fragment of the assistant's speech. Returns the buffer so far.
    pub fn append_output(&mut self, fragment: &str) -> &str {
        self.output.push_str(fragment);
        &self.output
    }

    /// Flush both buffers into history as `You: ...` and `<persona>: ...`.
    pub fn complete_turn(&mut self, persona: &str) -> CompletedTurn {
        let input = std::mem::take(&mut self.input);
        let output = std::mem::take(&mut self.output);

        let turn = CompletedTurn {
            user: format!("You: {}", input),
            assistant: format!("{}: {}", persona, output),
        };
        self.history.push(turn.user.clone());
        self.history.push(turn.assistant.clone());
        turn
    }

    /// Forget the current turn and the whole history.
    pub fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
        self.history.clear();
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }
}

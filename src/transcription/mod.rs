//! # Transcription Module
//!
//! The backend transcribes both sides of the conversation while it streams;
//! this module only assembles those fragments into turns and history.

pub mod aggregator;

pub use aggregator::TranscriptionAggregator;

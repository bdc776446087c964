//! Wake-phrase matching over transcripts.

pub mod matcher;

pub use matcher::WakeWordMatcher;

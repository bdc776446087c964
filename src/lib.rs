pub mod audio;
pub mod config;
pub mod controller;
pub mod llm;
pub mod speech;
pub mod stt;
pub mod wake;

#[cfg(test)]
mod test_support;

//! Sightline core library: a local gateway that streams Gemini chat, live logs and screenshots
//! to a browser client.

pub mod capture;
pub mod chat;
pub mod config;
pub mod gateway;
pub mod llm;
pub mod log_stream;
pub mod session;

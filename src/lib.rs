pub mod bot;
pub mod chatbot;
pub mod config;
pub mod error;
pub mod followup;
pub mod openrouter;
pub mod types;

pub use bot::run;

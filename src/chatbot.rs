//! AI chatbot module - replies to bot mentions.

mod context;
mod conversation;
mod handler;
mod response;

pub use handler::handle_bot_mention;

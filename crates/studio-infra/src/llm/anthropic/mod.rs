mod client;
mod streaming;
mod types;

pub use client::AnthropicProvider;

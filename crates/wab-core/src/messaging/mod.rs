//! Session-facing abstractions (the WhatsApp bridge today).

pub mod port;
pub mod types;

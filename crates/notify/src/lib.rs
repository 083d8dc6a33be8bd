pub mod commands;
pub mod formatter;
pub mod worker;

pub use commands::{start_bot, BotDeps};
pub use formatter::format_signal_message;
pub use worker::{backoff_seconds, NotificationWorker};

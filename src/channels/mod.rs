mod console;
mod hub;

pub use console::{spawn_stdin_reader, ConsoleChannel};
pub use hub::ChannelHub;

//! Point-to-point transport between processes: one lazily connected TCP
//! socket per directed channel, newline-delimited JSON records on the wire.

mod channel;
mod error;
pub mod framer;
mod listener;
mod reader;
mod sender;

pub use channel::Channel;
pub use error::Error;
pub use framer::Framer;
pub use listener::Listener;
pub use reader::Reader;
pub use sender::Sender;

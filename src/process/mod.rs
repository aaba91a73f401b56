mod hooks;
mod inbox;
mod runtime;

pub use hooks::{delivery_order, Admission, DeliveryOrder, Fifo, Interleaved};
pub use inbox::{inbox, Inbox, InboxSender, ProcessStatus};
pub use runtime::{Process, ProcessOutcome};

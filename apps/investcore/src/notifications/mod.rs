pub mod channel;
pub mod fanout;

pub use channel::{Channel, HttpEmailChannel, HttpSmsChannel, MockChannel, NotificationPayload};
pub use fanout::NotificationFanout;

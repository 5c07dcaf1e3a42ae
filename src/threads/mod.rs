mod bridge_worker;
mod relay;

pub use bridge_worker::spawn_bridge_worker;
pub use relay::{spawn_response_relay, Outbox};

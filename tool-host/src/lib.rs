pub mod host;
pub mod jsonrpc;
pub mod schema;
pub mod transport;

pub use host::{PromptCapability, ResourceCapability, ToolCapability, ToolHost};
pub use transport::{EventStream, SubscriptionEvent, Transport};

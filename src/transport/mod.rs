pub mod http;
pub mod mqtt;
pub mod traits;

pub use http::HttpTransport;
pub use mqtt::PersistentSession;
pub use traits::{SessionControl, Transport};

pub mod service;
pub mod sink;

pub use service::BrokerService;
pub use sink::{Sink, TracingSink};

pub mod connector;
pub mod message;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_util;

pub use connector::{Connector, ConnectorError, InboundSink};
pub use message::{InboundMessage, MessageFormat, OutboundMessage};

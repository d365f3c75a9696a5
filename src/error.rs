// Crate-level error surface. Every error enum is defined next to the code
// that raises it; this module gathers them so callers matching on
// `FlushError` variants can name the inner types without reaching into the
// defining modules.

pub use crate::cancel::Cancelled;
pub use crate::client::{ClientError, FlushError};
pub use crate::compress::CompressionError;
pub use crate::config::ConfigError;
pub use crate::retry::RetryError;
pub use crate::serialize::SerializationError;
pub use crate::transport::TransportError;

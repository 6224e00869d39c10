//! Wire types shared by the confsync owner and its replicas.
//!
//! - [`values`]: the settings map and the result values every operation returns
//! - [`messages`]: the request/response/push catalog
//! - [`frames`]: newline-delimited framing for stream transports

pub mod frames;
pub mod messages;
pub mod values;

pub use frames::{ClientFrame, ServerFrame, decode_line, encode_line};
pub use messages::{SyncPush, SyncRequest, SyncResponse};
pub use values::{DEFAULT_APPLIED, SettingsMap, ValidationErrors, ValidationResult, WriteOutcome};

/// Gateway core: backend adapters, credential management, stream
/// normalization, and model fallback behind a single facade.

pub mod credentials;
pub mod error;
pub mod event;
pub mod facade;
pub mod fallback;
pub mod fields;
pub mod http;
pub mod normalize;
pub mod process;
pub mod utils;

pub use event::{BackendKind, CancelToken, Request, SandboxMode, StopReason};
pub use facade::Gateway;

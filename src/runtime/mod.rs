//! Network runtime: HTTP models, framing, admission ceiling, listener and
//! the API router.

pub mod api;
pub mod framing;
pub mod http;
pub mod limiter;
pub mod listener;

pub use api::Router;
pub use framing::{read_request, FrameLimits, FramingError};
pub use http::{Request, Response};
pub use limiter::{ConnectionGuard, ConnectionLimiter};
pub use listener::{ConnectionSettings, Handler, Server, ServerError, StopHandle};

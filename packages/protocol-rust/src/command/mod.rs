//! Request/response commands over publish/subscribe.
//!
//! - [`invoker`]: sends requests and awaits correlated responses
//! - [`executor`]: validates requests, runs the handler, publishes responses
//! - [`cache`]: executor-side deduplication by correlation id
//! - [`middleware`]: tower layers around the handler

pub mod cache;
pub mod executor;
pub mod handler;
pub mod invoker;
pub mod middleware;
pub mod request;

pub use cache::{CachedResponse, ResponseCache};
pub use executor::CommandExecutor;
pub use handler::{handler_fn, Handler, HandlerService, Invocation};
pub use invoker::{CommandInvoker, COMMAND_TIMEOUT};
pub use request::{ApplicationError, CommandRequest, CommandResponse, DEFAULT_COMMAND_TIMEOUT};

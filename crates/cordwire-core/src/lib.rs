pub mod backoff;
pub mod dispatcher;

pub use backoff::Backoff;
pub use dispatcher::{DispatchError, Dispatcher, FromDispatch, HandlerHandle, Subscription};

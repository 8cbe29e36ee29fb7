pub mod config;
pub mod error;
pub mod gateway;
pub mod inflate;
pub mod limiter;
pub mod transport;
pub mod wire;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use gateway::{gateway_url, Gateway, GatewayHandle, GatewayState};
pub use inflate::Inflater;
pub use limiter::{CommandLimiter, IdentifyLimiter};
pub use transport::{Dialer, Frame, GatewayConn, WsConn, WsDialer};

pub mod envelope;
pub mod hub;
pub mod liveness;
pub mod pumps;
pub mod server;
pub mod session;

pub mod jsonrpc;
pub mod params;
pub mod router;
pub mod server;

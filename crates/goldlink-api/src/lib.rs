// goldlink-api: wire-level clients for Lince alarm panels (GoldCloud + EuroNET)

pub mod cloud;
pub mod error;
pub mod local;
pub mod session;
pub mod transport;
pub mod wire;

pub use error::Error;

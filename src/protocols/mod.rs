//! Protocol implementations.
//!
//! Each protocol has a parser module for the wire format and a handler
//! module that drives a client connection.
//!
//! - `modbus`: Modbus-TCP slave serving holding registers

pub mod modbus;

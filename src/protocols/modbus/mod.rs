//! Modbus-TCP protocol implementation.
//!
//! Serves the holding register table of a Modbus slave over TCP:
//!
//! | Function | Name                     | Request data                    |
//! |----------|--------------------------|---------------------------------|
//! | `0x03`   | Read Holding Registers   | address, quantity (1..=125)     |
//! | `0x06`   | Write Single Register    | address, value                  |
//! | `0x10`   | Write Multiple Registers | address, quantity (1..=123), byte count, values |
//!
//! Every other function code is answered with exception `0x01` (illegal
//! function). Addresses outside the bank are answered with `0x02` (illegal
//! data address) and quantities outside the allowed range with `0x03`
//! (illegal data value).
//!
//! Frames that cannot be decoded (wrong protocol id, impossible length,
//! payload that disagrees with its function code) are not answered: the
//! connection is closed, since the header of such a frame cannot be trusted.
//!
//! ## Example
//!
//! ```text
//! Request:  00 01 00 00 00 06 01 03 00 00 00 02   read 2 registers at 0
//! Response: 00 01 00 00 00 07 01 03 04 00 00 00 00
//!
//! Request:  00 02 00 00 00 06 01 03 00 08 00 05   read 5 registers at 8 (bank of 10)
//! Response: 00 02 00 00 00 03 01 83 02            illegal data address
//! ```

pub mod handler;
pub mod parser;

pub use handler::{handle_connection, ConnectionOptions, DEFAULT_FRAME_TIMEOUT};

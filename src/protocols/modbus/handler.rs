//! Modbus-TCP connection handler.
//!
//! Reads frames from a client, executes them against the register bank,
//! and writes the replies. One request is in flight per connection: the
//! next frame is not decoded until the previous reply has been written.

use super::parser::{
    decode, encode, DecodeError, ExceptionCode, Request, Response, MAX_READ_QUANTITY,
    MAX_WRITE_QUANTITY,
};
use crate::registers::RegisterBank;
use bytes::BytesMut;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Read buffer size (one maximal ADU is 260 bytes)
const BUFFER_SIZE: usize = 1024;

/// Default time allowed for the rest of a frame to arrive once it has started
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-connection settings
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Hex-dump every query and response
    pub debug: bool,
    /// Close the connection after this long without receiving data
    pub idle_timeout: Option<Duration>,
    /// Close the connection when a started frame stalls for this long
    pub frame_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            debug: false,
            idle_timeout: None,
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
        }
    }
}

/// Reasons a connection ended abnormally
#[derive(Debug)]
pub enum ConnectionError {
    Io(io::Error),
    Decode(DecodeError),
    IdleTimeout(Duration),
    /// A frame was started but not completed in time
    IncompleteFrame { received: usize },
}

impl ConnectionError {
    /// Whether the peer reset the connection (an ordinary disconnect for Modbus clients).
    pub fn is_reset(&self) -> bool {
        matches!(self, ConnectionError::Io(e) if e.kind() == io::ErrorKind::ConnectionReset)
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "I/O error: {e}"),
            ConnectionError::Decode(e) => write!(f, "invalid frame: {e}"),
            ConnectionError::IdleTimeout(after) => {
                write!(f, "idle for more than {}s", after.as_secs())
            }
            ConnectionError::IncompleteFrame { received } => {
                write!(f, "incomplete frame after {received} bytes")
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

/// Handle a single client connection.
///
/// Returns `Ok` when the peer closes the stream or `shutdown` fires while
/// waiting for a request. A reply that is already being written is always
/// finished first.
pub async fn handle_connection<S>(
    mut stream: S,
    registers: &RegisterBank,
    options: ConnectionOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        // Accumulate bytes until one whole frame is buffered
        let (frame, consumed) = loop {
            match decode(&buffer) {
                Ok(decoded) => break decoded,
                Err(DecodeError::TruncatedFrame) => {}
                Err(e) => return Err(e.into()),
            }

            if *shutdown.borrow() {
                trace!("Closing connection for shutdown");
                return Ok(());
            }

            let n = tokio::select! {
                read = read_frame_bytes(&mut stream, &mut buffer, &options) => read?,
                changed = shutdown.changed() => {
                    // A dropped sender means the server is gone
                    if changed.is_err() {
                        return Ok(());
                    }
                    continue;
                }
            };
            if n == 0 {
                trace!(pending = buffer.len(), "Connection closed by client");
                return Ok(());
            }
        };

        let query = buffer.split_to(consumed);
        if options.debug {
            debug!(length = query.len(), data = %hex_dump(&query), "Received query");
        }
        trace!(request = ?frame.request, "Processing request");

        let response = apply(&frame.request, registers);
        let reply = encode(frame.header.transaction_id, frame.header.unit_id, &response);

        stream.write_all(&reply).await?;
        stream.flush().await?;

        if options.debug {
            debug!(length = reply.len(), data = %hex_dump(&reply), "Sent response");
        }
    }
}

/// Read more bytes, bounded by the frame timeout once a frame has started
/// and by the idle timeout (if any) between frames.
async fn read_frame_bytes<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    options: &ConnectionOptions,
) -> Result<usize, ConnectionError>
where
    S: AsyncRead + Unpin,
{
    let received = buffer.len();
    let (limit, expired) = if received > 0 {
        (
            Some(options.frame_timeout),
            ConnectionError::IncompleteFrame { received },
        )
    } else {
        let idle = options.idle_timeout.unwrap_or_default();
        (options.idle_timeout, ConnectionError::IdleTimeout(idle))
    };

    match limit {
        Some(after) => match tokio::time::timeout(after, stream.read_buf(buffer)).await {
            Ok(read) => Ok(read?),
            Err(_) => Err(expired),
        },
        None => Ok(stream.read_buf(buffer).await?),
    }
}

/// Execute a request against the register bank.
///
/// Every request yields a response: invalid quantities, addresses, and
/// function codes become exception responses. A rejected request never
/// modifies the bank.
pub fn apply(request: &Request, registers: &RegisterBank) -> Response {
    let function = request.function_code();
    let exception = |code| Response::Exception { function, code };

    match request {
        Request::ReadHoldingRegisters { address, quantity } => {
            if !(1..=MAX_READ_QUANTITY).contains(quantity) {
                return exception(ExceptionCode::IllegalDataValue);
            }
            match registers.read(*address, usize::from(*quantity)) {
                Ok(values) => Response::ReadHoldingRegisters(values),
                Err(_) => exception(ExceptionCode::IllegalDataAddress),
            }
        }

        Request::WriteSingleRegister { address, value } => {
            match registers.write(*address, *value) {
                Ok(()) => Response::WriteSingleRegister {
                    address: *address,
                    value: *value,
                },
                Err(_) => exception(ExceptionCode::IllegalDataAddress),
            }
        }

        Request::WriteMultipleRegisters { address, values } => {
            // The decoder guarantees len() fits in u16.
            let quantity = values.len() as u16;
            if !(1..=MAX_WRITE_QUANTITY).contains(&quantity) {
                return exception(ExceptionCode::IllegalDataValue);
            }
            match registers.write_multiple(*address, values) {
                Ok(()) => Response::WriteMultipleRegisters {
                    address: *address,
                    quantity,
                },
                Err(_) => exception(ExceptionCode::IllegalDataAddress),
            }
        }

        Request::Unknown { .. } => exception(ExceptionCode::IllegalFunction),
    }
}

/// Uppercase, space separated hex of a raw frame.
fn hex_dump(data: &[u8]) -> String {
    data.chunks(1)
        .map(hex::encode_upper)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio_test::io::Builder;

    fn read_request(address: u16, quantity: u16) -> Request {
        Request::ReadHoldingRegisters { address, quantity }
    }

    #[test]
    fn test_read_holding_registers() {
        let registers = RegisterBank::new(10);
        registers.write_multiple(0, &[1, 2, 3, 4, 5]).unwrap();

        assert_eq!(
            apply(&read_request(1, 3), &registers),
            Response::ReadHoldingRegisters(vec![2, 3, 4])
        );
        assert_eq!(
            apply(&read_request(0, 10), &registers),
            Response::ReadHoldingRegisters(vec![1, 2, 3, 4, 5, 0, 0, 0, 0, 0])
        );
    }

    #[test]
    fn test_read_quantity_limits() {
        let registers = RegisterBank::new(200);
        let illegal_value = Response::Exception {
            function: 0x03,
            code: ExceptionCode::IllegalDataValue,
        };

        assert_eq!(apply(&read_request(0, 0), &registers), illegal_value);
        assert_eq!(apply(&read_request(0, 126), &registers), illegal_value);
        assert!(matches!(
            apply(&read_request(0, 125), &registers),
            Response::ReadHoldingRegisters(values) if values.len() == 125
        ));
    }

    #[test]
    fn test_read_out_of_range() {
        let registers = RegisterBank::new(10);
        assert_eq!(
            apply(&read_request(8, 5), &registers),
            Response::Exception {
                function: 0x03,
                code: ExceptionCode::IllegalDataAddress
            }
        );
        assert_eq!(
            apply(&read_request(u16::MAX, 1), &registers),
            Response::Exception {
                function: 0x03,
                code: ExceptionCode::IllegalDataAddress
            }
        );
    }

    #[test]
    fn test_quantity_checked_before_address() {
        let registers = RegisterBank::new(10);
        assert_eq!(
            apply(&read_request(50, 0), &registers),
            Response::Exception {
                function: 0x03,
                code: ExceptionCode::IllegalDataValue
            }
        );
    }

    #[test]
    fn test_write_single_register() {
        let registers = RegisterBank::new(10);

        let response = apply(
            &Request::WriteSingleRegister {
                address: 2,
                value: 42,
            },
            &registers,
        );
        assert_eq!(
            response,
            Response::WriteSingleRegister {
                address: 2,
                value: 42
            }
        );
        assert_eq!(registers.read(0, 5).unwrap(), vec![0, 0, 42, 0, 0]);

        let response = apply(
            &Request::WriteSingleRegister {
                address: 10,
                value: 1,
            },
            &registers,
        );
        assert_eq!(
            response,
            Response::Exception {
                function: 0x06,
                code: ExceptionCode::IllegalDataAddress
            }
        );
    }

    #[test]
    fn test_write_multiple_registers() {
        let registers = RegisterBank::new(10);

        let response = apply(
            &Request::WriteMultipleRegisters {
                address: 6,
                values: vec![7, 8, 9, 10],
            },
            &registers,
        );
        assert_eq!(
            response,
            Response::WriteMultipleRegisters {
                address: 6,
                quantity: 4
            }
        );
        assert_eq!(registers.read(6, 4).unwrap(), vec![7, 8, 9, 10]);
    }

    #[test]
    fn test_rejected_write_multiple_leaves_bank_unmodified() {
        let registers = RegisterBank::new(200);

        let out_of_range = apply(
            &Request::WriteMultipleRegisters {
                address: 198,
                values: vec![1, 2, 3],
            },
            &registers,
        );
        assert_eq!(
            out_of_range,
            Response::Exception {
                function: 0x10,
                code: ExceptionCode::IllegalDataAddress
            }
        );

        for values in [vec![], vec![1; 124]] {
            let response = apply(&Request::WriteMultipleRegisters { address: 0, values }, &registers);
            assert_eq!(
                response,
                Response::Exception {
                    function: 0x10,
                    code: ExceptionCode::IllegalDataValue
                }
            );
        }

        assert_eq!(registers.read(0, 125).unwrap(), vec![0; 125]);
        assert_eq!(registers.read(125, 75).unwrap(), vec![0; 75]);
    }

    #[test]
    fn test_unknown_function() {
        let registers = RegisterBank::new(10);
        for function in [0x01, 0x04, 0x05, 0x0F, 0x17, 0x2B, 0x83] {
            let response = apply(
                &Request::Unknown {
                    function,
                    payload: Bytes::new(),
                },
                &registers,
            );
            assert_eq!(
                response,
                Response::Exception {
                    function,
                    code: ExceptionCode::IllegalFunction
                }
            );
        }
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0x00, 0x01, 0xAB, 0xFF]), "00 01 AB FF");
        assert_eq!(hex_dump(&[]), "");
    }

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            debug: true,
            ..ConnectionOptions::default()
        }
    }

    #[tokio::test]
    async fn test_connection_read_write_cycle() {
        let registers = RegisterBank::new(10);
        let (_tx, rx) = watch::channel(false);

        // The write request arrives split across two reads.
        let stream = Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00])
            .read(&[0x02, 0x00, 0x2A])
            .write(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x02, 0x00, 0x2A])
            .read(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x01, 0x00, 0x02])
            .write(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x00, 0x00, 0x00, 0x2A])
            .build();

        handle_connection(stream, &registers, options(), rx)
            .await
            .unwrap();
        assert_eq!(registers.read(2, 1).unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn test_connection_pipelined_requests() {
        let registers = RegisterBank::new(10);
        let (_tx, rx) = watch::channel(false);

        let mut requests = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x00, 0x00, 0x07];
        requests.extend_from_slice(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x02, 0x01, 0x41]);

        let stream = Builder::new()
            .read(&requests)
            .write(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x00, 0x00, 0x07])
            .write(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0x01, 0xC1, 0x01])
            .build();

        handle_connection(stream, &registers, options(), rx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connection_malformed_frame_closes_without_reply() {
        let registers = RegisterBank::new(10);
        let (_tx, rx) = watch::channel(false);

        // Length says 4 but a write-single request needs 6.
        let stream = Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x04, 0x01, 0x06, 0x00, 0x02])
            .build();

        let result = handle_connection(stream, &registers, options(), rx).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Decode(DecodeError::MalformedPayload { .. }))
        ));
        assert_eq!(registers.read(0, 10).unwrap(), vec![0; 10]);
    }

    #[tokio::test]
    async fn test_connection_invalid_protocol_id() {
        let registers = RegisterBank::new(10);
        let (_tx, rx) = watch::channel(false);

        let stream = Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01])
            .build();

        let result = handle_connection(stream, &registers, options(), rx).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Decode(DecodeError::InvalidProtocolId(1)))
        ));
    }

    #[tokio::test]
    async fn test_connection_eof_mid_frame() {
        let registers = RegisterBank::new(10);
        let (_tx, rx) = watch::channel(false);

        let stream = Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01])
            .build();

        handle_connection(stream, &registers, options(), rx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connection_reset_is_reported() {
        let registers = RegisterBank::new(10);
        let (_tx, rx) = watch::channel(false);

        let stream = Builder::new()
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();

        let err = handle_connection(stream, &registers, options(), rx)
            .await
            .unwrap_err();
        assert!(err.is_reset());
    }

    #[tokio::test]
    async fn test_connection_idle_timeout() {
        let registers = RegisterBank::new(10);
        let (_tx, rx) = watch::channel(false);
        let (client, server) = tokio::io::duplex(64);

        let options = ConnectionOptions {
            debug: false,
            idle_timeout: Some(Duration::from_millis(50)),
            ..ConnectionOptions::default()
        };
        let err = handle_connection(server, &registers, options, rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::IdleTimeout(_)));
        drop(client);
    }

    #[tokio::test]
    async fn test_connection_stalled_frame_closes_without_reply() {
        let registers = RegisterBank::new(10);
        let (_tx, rx) = watch::channel(false);
        let (mut client, server) = tokio::io::duplex(64);

        // Length announces 6 bytes but only 3 follow the header, and the
        // client keeps the stream open.
        client
            .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00])
            .await
            .unwrap();

        let options = ConnectionOptions {
            frame_timeout: Duration::from_millis(100),
            ..ConnectionOptions::default()
        };
        let result = tokio::time::timeout(
            Duration::from_secs(3),
            handle_connection(server, &registers, options, rx),
        )
        .await
        .expect("connection should give up on the stalled frame");
        assert!(matches!(
            result,
            Err(ConnectionError::IncompleteFrame { received: 10 })
        ));

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty(), "unexpected reply {reply:02X?}");
        assert_eq!(registers.read(0, 10).unwrap(), vec![0; 10]);
    }

    #[tokio::test]
    async fn test_default_frame_timeout_is_armed() {
        let registers = RegisterBank::new(10);
        let (_tx, rx) = watch::channel(false);
        let (mut client, server) = tokio::io::duplex(64);

        client.write_all(&[0x00, 0x01, 0x00]).await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            handle_connection(server, &registers, ConnectionOptions::default(), rx),
        )
        .await
        .expect("default options should close a stalled frame");
        assert!(matches!(result, Err(ConnectionError::IncompleteFrame { .. })));
        drop(client);
    }

    #[tokio::test]
    async fn test_connection_stops_on_shutdown() {
        let registers = RegisterBank::new(10);
        let (tx, rx) = watch::channel(false);
        let (_client, server) = tokio::io::duplex(64);

        let task = {
            let registers = Arc::clone(&registers);
            tokio::spawn(async move {
                handle_connection(server, &registers, ConnectionOptions::default(), rx).await
            })
        };

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}

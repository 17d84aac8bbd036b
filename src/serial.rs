//! Serial multiplexer for the shared RS-485 bus
//!
//! This module owns the single serial port shared by the VFD and the sensors
//! and provides typed Modbus RTU read/write primitives. Every operation is
//! one critical section: acquire the transaction mutex, select the slave
//! address, perform the framed exchange, release on all exit paths. The lock
//! is deliberately coarse so request and response frames of different slaves
//! can never interleave on the wire.

use crate::config::SerialConfig;
use crate::error::{Result, TorrError};
use crate::logging::get_logger;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::rtu;
use tokio_modbus::prelude::*;
use tokio_serial::SerialStream;

/// Widest register count accepted by the typed primitives
const MAX_REGISTERS: u16 = 125;

/// Abstraction over one slave-addressed Modbus exchange.
///
/// `SerialCom` is generic over this trait so tests can substitute a fake bus
/// and assert serialization and lock release without hardware.
#[async_trait::async_trait]
pub trait ModbusPort: Send {
    async fn read_coils(&mut self, slave: u8, address: u16, count: u16) -> Result<Vec<bool>>;

    async fn read_holding_registers(
        &mut self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>>;

    async fn read_input_registers(
        &mut self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>>;

    async fn write_single_register(&mut self, slave: u8, address: u16, value: u16) -> Result<()>;

    async fn write_multiple_registers(
        &mut self,
        slave: u8,
        address: u16,
        values: &[u16],
    ) -> Result<()>;
}

/// Real RTU transport over the configured serial port
struct RtuPort {
    ctx: tokio_modbus::client::Context,
    operation_timeout: Duration,
}

/// Run one framed exchange under a wall-clock timeout, flattening the
/// transport-error / protocol-exception layers into `TorrError::Serial`.
async fn run_exchange<T, Exception, Transport>(
    what: &str,
    op_timeout: Duration,
    request: impl std::future::Future<
        Output = std::result::Result<std::result::Result<T, Exception>, Transport>,
    >,
) -> Result<T>
where
    Exception: std::fmt::Debug,
    Transport: std::fmt::Display,
{
    match timeout(op_timeout, request).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(exception))) => Err(TorrError::serial(format!(
            "{} rejected by slave: {:?}",
            what, exception
        ))),
        Ok(Err(e)) => Err(TorrError::serial(format!("{} failed: {}", what, e))),
        Err(_) => Err(TorrError::timeout(format!("{} timed out", what))),
    }
}

#[async_trait::async_trait]
impl ModbusPort for RtuPort {
    async fn read_coils(&mut self, slave: u8, address: u16, count: u16) -> Result<Vec<bool>> {
        let op_timeout = self.operation_timeout;
        self.ctx.set_slave(Slave(slave));
        run_exchange("read coils", op_timeout, self.ctx.read_coils(address, count)).await
    }

    async fn read_holding_registers(
        &mut self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let op_timeout = self.operation_timeout;
        self.ctx.set_slave(Slave(slave));
        run_exchange(
            "read holding registers",
            op_timeout,
            self.ctx.read_holding_registers(address, count),
        )
        .await
    }

    async fn read_input_registers(
        &mut self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let op_timeout = self.operation_timeout;
        self.ctx.set_slave(Slave(slave));
        run_exchange(
            "read input registers",
            op_timeout,
            self.ctx.read_input_registers(address, count),
        )
        .await
    }

    async fn write_single_register(&mut self, slave: u8, address: u16, value: u16) -> Result<()> {
        let op_timeout = self.operation_timeout;
        self.ctx.set_slave(Slave(slave));
        run_exchange(
            "write single register",
            op_timeout,
            self.ctx.write_single_register(address, value),
        )
        .await
    }

    async fn write_multiple_registers(
        &mut self,
        slave: u8,
        address: u16,
        values: &[u16],
    ) -> Result<()> {
        let op_timeout = self.operation_timeout;
        self.ctx.set_slave(Slave(slave));
        run_exchange(
            "write multiple registers",
            op_timeout,
            self.ctx.write_multiple_registers(address, values),
        )
        .await
    }
}

/// Multiplexer owning the serial handle for process life.
///
/// All methods may be called concurrently from any task; exchanges are
/// serialized in arrival order under the transaction mutex.
pub struct SerialCom {
    port: Mutex<Box<dyn ModbusPort>>,
    logger: crate::logging::StructuredLogger,
}

impl SerialCom {
    /// Open the configured serial port and attach the RTU codec
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let builder = tokio_serial::new(config.port.as_str(), config.baudrate)
            .data_bits(data_bits(config.bytesize)?)
            .parity(parity(&config.parity)?)
            .stop_bits(stop_bits(config.stopbits)?)
            .timeout(Duration::from_secs_f64(config.timeout));

        let stream = SerialStream::open(&builder)?;
        let ctx = rtu::attach_slave(stream, Slave(1));

        let logger = get_logger("serial");
        logger.info(&format!(
            "Opened {} at {} baud ({}{}{})",
            config.port, config.baudrate, config.bytesize, config.parity, config.stopbits
        ));

        Ok(Self {
            port: Mutex::new(Box::new(RtuPort {
                ctx,
                operation_timeout: Duration::from_secs_f64(config.timeout.max(0.1)),
            })),
            logger,
        })
    }

    /// Build a multiplexer over an arbitrary transport (used by tests)
    pub fn with_port(port: Box<dyn ModbusPort>) -> Self {
        Self {
            port: Mutex::new(port),
            logger: get_logger("serial"),
        }
    }

    /// Read an IEEE-754 float spanning 2 registers (f32) or 4 registers (f64)
    pub async fn read_float(&self, slave: u8, register: u16, registers: u16) -> Result<f64> {
        let regs = self.read_registers(slave, register, registers, 3).await?;
        match registers {
            2 => Ok(f64::from(decode_32bit_float(&regs)?)),
            4 => decode_64bit_float(&regs),
            _ => Err(TorrError::validation(
                "registers",
                "float spans 2 or 4 registers",
            )),
        }
    }

    /// Read an unsigned integer spanning 1 or 2 registers, big-endian
    pub async fn read_int(&self, slave: u8, register: u16, registers: u16) -> Result<i64> {
        let regs = self.read_registers(slave, register, registers, 3).await?;
        match registers {
            1 => Ok(i64::from(regs[0])),
            2 => Ok(i64::from(decode_32bit_uint(&regs)?)),
            _ => Err(TorrError::validation(
                "registers",
                "integer spans 1 or 2 registers",
            )),
        }
    }

    /// Read an ASCII string packed two characters per register
    pub async fn read_string(&self, slave: u8, register: u16, registers: u16) -> Result<String> {
        let regs = self.read_registers(slave, register, registers, 3).await?;
        decode_string(&regs, None)
    }

    /// Read a single register and scale it by `decimals` decimal places
    pub async fn read_register(
        &self,
        slave: u8,
        register: u16,
        decimals: u8,
        function_code: u8,
    ) -> Result<f64> {
        let regs = self.read_registers(slave, register, 1, function_code).await?;
        Ok(f64::from(regs[0]) / 10f64.powi(i32::from(decimals)))
    }

    /// Read `count` consecutive registers with the given function code
    pub async fn read_registers(
        &self,
        slave: u8,
        register: u16,
        count: u16,
        function_code: u8,
    ) -> Result<Vec<u16>> {
        if count == 0 || count > MAX_REGISTERS {
            return Err(TorrError::validation("count", "out of range"));
        }

        self.logger.debug(&format!(
            "Acquiring bus for slave {} (fc {}, register {}, count {})",
            slave, function_code, register, count
        ));
        let mut port = self.port.lock().await;
        let result = match function_code {
            1 => port
                .read_coils(slave, register, count)
                .await
                .map(|bits| bits.into_iter().map(u16::from).collect()),
            3 => port.read_holding_registers(slave, register, count).await,
            4 => port.read_input_registers(slave, register, count).await,
            other => Err(TorrError::validation(
                "function_code".to_string(),
                format!("unsupported read function code {}", other),
            )),
        };
        drop(port);

        match result {
            Ok(regs) => {
                self.logger
                    .trace(&format!("Read from slave {}: {:?}", slave, regs));
                Ok(regs)
            }
            Err(e) => {
                self.logger
                    .warn(&format!("Read from slave {} failed: {}", slave, e));
                Err(e)
            }
        }
    }

    /// Read a contiguous block of holding registers
    pub async fn read_block(&self, slave: u8, register: u16, count: u16) -> Result<Vec<u16>> {
        self.read_registers(slave, register, count, 3).await
    }

    /// Write an IEEE-754 f32 across 2 registers
    pub async fn write_float(&self, slave: u8, register: u16, value: f64) -> Result<()> {
        let regs = encode_32bit_float(value as f32);
        self.write_words(slave, register, &regs, 16).await
    }

    /// Write an unsigned integer to a single register
    pub async fn write_int(&self, slave: u8, register: u16, value: i64) -> Result<()> {
        let word = u16::try_from(value)
            .map_err(|_| TorrError::validation("value", "does not fit a register"))?;
        self.write_words(slave, register, &[word], 6).await
    }

    /// Write an ASCII string packed two characters per register
    pub async fn write_string(&self, slave: u8, register: u16, value: &str) -> Result<()> {
        let regs = encode_string(value)?;
        self.write_words(slave, register, &regs, 16).await
    }

    /// Write a scaled value to a single register.
    ///
    /// The value is multiplied by 10^decimals and rounded before transmission,
    /// matching the register conventions of the drive (2 decimals on the
    /// frequency register).
    pub async fn write_register(
        &self,
        slave: u8,
        register: u16,
        value: f64,
        decimals: u8,
        function_code: u8,
        signed: bool,
    ) -> Result<()> {
        let word = scale_for_write(value, decimals, signed)?;
        self.write_words(slave, register, &[word], function_code)
            .await
    }

    async fn write_words(
        &self,
        slave: u8,
        register: u16,
        values: &[u16],
        function_code: u8,
    ) -> Result<()> {
        self.logger.debug(&format!(
            "Acquiring bus for slave {} (fc {}, register {}, {} word(s))",
            slave,
            function_code,
            register,
            values.len()
        ));
        let mut port = self.port.lock().await;
        let result = match function_code {
            6 if values.len() == 1 => port.write_single_register(slave, register, values[0]).await,
            6 => Err(TorrError::validation(
                "function_code",
                "function code 6 writes exactly one register",
            )),
            16 => port.write_multiple_registers(slave, register, values).await,
            other => Err(TorrError::validation(
                "function_code".to_string(),
                format!("unsupported write function code {}", other),
            )),
        };
        drop(port);

        match result {
            Ok(()) => {
                self.logger.debug(&format!(
                    "Wrote {:?} to register {} on slave {}",
                    values, register, slave
                ));
                Ok(())
            }
            Err(e) => {
                self.logger
                    .warn(&format!("Write to slave {} failed: {}", slave, e));
                Err(e)
            }
        }
    }
}

fn data_bits(bytesize: u8) -> Result<tokio_serial::DataBits> {
    match bytesize {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        _ => Err(TorrError::validation("serial.bytesize", "must be 5-8")),
    }
}

fn parity(name: &str) -> Result<tokio_serial::Parity> {
    match name.to_lowercase().as_str() {
        "none" | "n" => Ok(tokio_serial::Parity::None),
        "even" | "e" => Ok(tokio_serial::Parity::Even),
        "odd" | "o" => Ok(tokio_serial::Parity::Odd),
        _ => Err(TorrError::validation(
            "serial.parity",
            "must be none, even or odd",
        )),
    }
}

fn stop_bits(stopbits: u8) -> Result<tokio_serial::StopBits> {
    match stopbits {
        1 => Ok(tokio_serial::StopBits::One),
        2 => Ok(tokio_serial::StopBits::Two),
        _ => Err(TorrError::validation("serial.stopbits", "must be 1 or 2")),
    }
}

/// Utility functions for data conversion

/// Decode 32-bit float from two 16-bit registers (big-endian)
pub fn decode_32bit_float(registers: &[u16]) -> Result<f32> {
    if registers.len() < 2 {
        return Err(TorrError::serial(
            "Insufficient registers for 32-bit float",
        ));
    }

    let bytes = [
        (registers[0] >> 8) as u8,
        (registers[0] & 0xFF) as u8,
        (registers[1] >> 8) as u8,
        (registers[1] & 0xFF) as u8,
    ];

    Ok(f32::from_be_bytes(bytes))
}

/// Decode 64-bit float from four 16-bit registers (big-endian)
pub fn decode_64bit_float(registers: &[u16]) -> Result<f64> {
    if registers.len() < 4 {
        return Err(TorrError::serial(
            "Insufficient registers for 64-bit float",
        ));
    }

    let bytes = [
        (registers[0] >> 8) as u8,
        (registers[0] & 0xFF) as u8,
        (registers[1] >> 8) as u8,
        (registers[1] & 0xFF) as u8,
        (registers[2] >> 8) as u8,
        (registers[2] & 0xFF) as u8,
        (registers[3] >> 8) as u8,
        (registers[3] & 0xFF) as u8,
    ];

    Ok(f64::from_be_bytes(bytes))
}

/// Decode an unsigned 32-bit integer from two registers (big-endian)
pub fn decode_32bit_uint(registers: &[u16]) -> Result<u32> {
    if registers.len() < 2 {
        return Err(TorrError::serial(
            "Insufficient registers for 32-bit integer",
        ));
    }

    Ok((u32::from(registers[0]) << 16) | u32::from(registers[1]))
}

/// Decode string from registers
pub fn decode_string(registers: &[u16], max_length: Option<usize>) -> Result<String> {
    let mut bytes = Vec::new();

    for &reg in registers {
        bytes.push((reg >> 8) as u8);
        bytes.push((reg & 0xFF) as u8);
    }

    // Remove null terminators and trailing whitespace
    let string = String::from_utf8(bytes)
        .map_err(|e| TorrError::serial(format!("Invalid UTF-8 string: {}", e)))?;

    let string = string.trim_matches('\0').trim();

    if let Some(max_len) = max_length {
        Ok(string.chars().take(max_len).collect())
    } else {
        Ok(string.to_string())
    }
}

/// Encode 32-bit float to two 16-bit registers (big-endian)
pub fn encode_32bit_float(value: f32) -> [u16; 2] {
    let bytes = value.to_be_bytes();
    [
        ((bytes[0] as u16) << 8) | (bytes[1] as u16),
        ((bytes[2] as u16) << 8) | (bytes[3] as u16),
    ]
}

/// Encode an ASCII string into registers, two characters per register
pub fn encode_string(value: &str) -> Result<Vec<u16>> {
    if !value.is_ascii() {
        return Err(TorrError::validation("value", "must be ASCII"));
    }

    let mut bytes: Vec<u8> = value.as_bytes().to_vec();
    if bytes.len() % 2 != 0 {
        bytes.push(0);
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| (u16::from(pair[0]) << 8) | u16::from(pair[1]))
        .collect())
}

/// Scale a value by 10^decimals and fit it into one register
pub fn scale_for_write(value: f64, decimals: u8, signed: bool) -> Result<u16> {
    if decimals > 4 {
        return Err(TorrError::validation("decimals", "must be 0-4"));
    }

    let scaled = (value * 10f64.powi(i32::from(decimals))).round();
    if signed {
        if scaled < f64::from(i16::MIN) || scaled > f64::from(i16::MAX) {
            return Err(TorrError::validation("value", "out of signed range"));
        }
        Ok((scaled as i16) as u16)
    } else {
        if scaled < 0.0 || scaled > f64::from(u16::MAX) {
            return Err(TorrError::validation("value", "out of unsigned range"));
        }
        Ok(scaled as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_32bit_float() {
        let registers = [0x3F80, 0x0000]; // 1.0 in big-endian
        let result = decode_32bit_float(&registers).unwrap();
        assert!((result - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_decode_64bit_float() {
        let registers = [0x3FF0, 0x0000, 0x0000, 0x0000]; // 1.0 in big-endian
        let result = decode_64bit_float(&registers).unwrap();
        assert!((result - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_decode_32bit_uint() {
        assert_eq!(decode_32bit_uint(&[0x0001, 0x0000]).unwrap(), 65536);
        assert_eq!(decode_32bit_uint(&[0x0000, 0x1234]).unwrap(), 0x1234);
        assert!(decode_32bit_uint(&[0x0001]).is_err());
    }

    #[test]
    fn test_encode_32bit_float() {
        let value = 1.0f32;
        let registers = encode_32bit_float(value);
        assert_eq!(registers, [0x3F80, 0x0000]);
    }

    #[test]
    fn test_decode_string() {
        let registers = [0x0041, 0x0042, 0x0043]; // "ABC"
        let result = decode_string(&registers, None).unwrap();
        assert_eq!(result, "ABC");
    }

    #[test]
    fn test_encode_string_pads_odd_length() {
        let regs = encode_string("ABC").unwrap();
        assert_eq!(regs, vec![0x4142, 0x4300]);
        assert!(encode_string("é").is_err());
    }

    #[test]
    fn test_scale_for_write() {
        // 30 Hz with 2 decimals -> 3000 on the wire
        assert_eq!(scale_for_write(30.0, 2, false).unwrap(), 3000);
        assert_eq!(scale_for_write(1.239, 2, false).unwrap(), 124);
        assert_eq!(scale_for_write(-1.0, 0, true).unwrap(), 0xFFFF);
        assert!(scale_for_write(-1.0, 0, false).is_err());
        assert!(scale_for_write(600.0, 2, false).is_ok());
        assert!(scale_for_write(700.0, 2, false).is_err());
        assert!(scale_for_write(1.0, 9, false).is_err());
    }

    #[test]
    fn test_serial_line_parameters() {
        assert!(parity("none").is_ok());
        assert!(parity("E").is_ok());
        assert!(parity("mark").is_err());
        assert!(data_bits(8).is_ok());
        assert!(data_bits(9).is_err());
        assert!(stop_bits(1).is_ok());
        assert!(stop_bits(3).is_err());
    }
}

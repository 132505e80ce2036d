//! Typed builders for the three Modbus function codes the device uses.
//!
//! Register ids are 1-based in the vendor documentation and in the catalog;
//! the wire carries `id - 1`. The builders take the 1-based address.

use crate::error::{Error, Result};
use crate::frame::AsciiFrame;

pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_WRITE_HOLDING_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_HOLDING_REGISTERS: u8 = 0x10;

/// Largest register count a single read may request.
const MAX_READ_QUANTITY: u16 = 0x7c;

/// An encoded request frame ready for the transport.
#[derive(Debug, Clone)]
pub struct ModbusRequest {
    frame: AsciiFrame,
    function_code: u8,
}

impl ModbusRequest {
    /// Read `quantity` holding registers starting at 1-based `addr`.
    pub fn read_holding_registers(dev: u8, addr: u16, quantity: u16) -> Result<Self> {
        if addr < 1 {
            return Err(Error::InvalidRequest("register address must be >= 1"));
        }
        if quantity < 1 || quantity > MAX_READ_QUANTITY {
            return Err(Error::InvalidRequest("read quantity out of range"));
        }
        let wire = addr - 1;
        let payload = [
            dev,
            FC_READ_HOLDING_REGISTERS,
            (wire >> 8) as u8,
            (wire & 0xff) as u8,
            (quantity >> 8) as u8,
            (quantity & 0xff) as u8,
        ];
        Ok(Self {
            frame: AsciiFrame::encode(&payload)?,
            function_code: FC_READ_HOLDING_REGISTERS,
        })
    }

    /// Write a single holding register at 1-based `addr`.
    pub fn write_holding_register(dev: u8, addr: u16, value: u16) -> Result<Self> {
        if addr < 1 {
            return Err(Error::InvalidRequest("register address must be >= 1"));
        }
        if value == 0xffff {
            return Err(Error::InvalidRequest("register value out of range"));
        }
        let wire = addr - 1;
        let payload = [
            dev,
            FC_WRITE_HOLDING_REGISTER,
            (wire >> 8) as u8,
            (wire & 0xff) as u8,
            (value >> 8) as u8,
            (value & 0xff) as u8,
        ];
        Ok(Self {
            frame: AsciiFrame::encode(&payload)?,
            function_code: FC_WRITE_HOLDING_REGISTER,
        })
    }

    /// Write `values` into consecutive holding registers starting at
    /// 1-based `addr`.
    pub fn write_multiple_holding_registers(dev: u8, addr: u16, values: &[u16]) -> Result<Self> {
        if addr < 1 {
            return Err(Error::InvalidRequest("register address must be >= 1"));
        }
        if values.is_empty() || values.len() > MAX_READ_QUANTITY as usize {
            return Err(Error::InvalidRequest("write quantity out of range"));
        }
        let quantity = values.len() as u16;
        let wire = addr - 1;
        let mut payload = Vec::with_capacity(7 + values.len() * 2);
        payload.extend_from_slice(&[
            dev,
            FC_WRITE_MULTIPLE_HOLDING_REGISTERS,
            (wire >> 8) as u8,
            (wire & 0xff) as u8,
            (quantity >> 8) as u8,
            (quantity & 0xff) as u8,
            (quantity * 2) as u8,
        ]);
        for v in values {
            if *v == 0xffff {
                return Err(Error::InvalidRequest("register value out of range"));
            }
            payload.push((v >> 8) as u8);
            payload.push((v & 0xff) as u8);
        }
        Ok(Self {
            frame: AsciiFrame::encode(&payload)?,
            function_code: FC_WRITE_MULTIPLE_HOLDING_REGISTERS,
        })
    }

    pub fn frame(&self) -> &AsciiFrame {
        &self.frame
    }

    pub fn function_code(&self) -> u8 {
        self.function_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn read_request_uses_wire_address() {
        // register 40004 goes on the wire as 40003 = 0x9C43
        let req = ModbusRequest::read_holding_registers(1, 40004, 5).unwrap();
        assert_eq!(
            req.frame().payload(),
            &[0x01, 0x03, 0x9C, 0x43, 0x00, 0x05]
        );
    }

    #[test]
    fn write_request_layout() {
        let req = ModbusRequest::write_holding_register(1, 43005, 0xF830).unwrap();
        assert_eq!(
            req.frame().payload(),
            &[0x01, 0x06, 0xA7, 0xFC, 0xF8, 0x30]
        );
    }

    #[test]
    fn write_multiple_layout() {
        let req =
            ModbusRequest::write_multiple_holding_registers(1, 47015, &[200, 200]).unwrap();
        assert_eq!(
            req.frame().payload(),
            &[0x01, 0x10, 0xB7, 0xA6, 0x00, 0x02, 0x04, 0x00, 0xC8, 0x00, 0xC8]
        );
    }

    #[test]
    fn argument_validation() {
        assert_matches!(
            ModbusRequest::read_holding_registers(1, 0, 1),
            Err(Error::InvalidRequest(_))
        );
        assert_matches!(
            ModbusRequest::read_holding_registers(1, 40004, 0),
            Err(Error::InvalidRequest(_))
        );
        assert_matches!(
            ModbusRequest::read_holding_registers(1, 40004, 0x7d),
            Err(Error::InvalidRequest(_))
        );
        assert_matches!(
            ModbusRequest::write_holding_register(1, 43005, 0xffff),
            Err(Error::InvalidRequest(_))
        );
        assert_matches!(
            ModbusRequest::write_multiple_holding_registers(1, 43005, &[]),
            Err(Error::InvalidRequest(_))
        );
    }
}

//! Command response framing.
//!
//! A response is produced by a command handler and consumed immediately by
//! the host controller; it is never persisted. Native-mode frames carry a
//! CRC7 trailer; SPI-mode frames lead with the one-byte SPI status and, for
//! register reads, inline a simulated data-block frame (start token,
//! register bytes, CRC16).

use crate::crc;

/// Largest frame we ever produce: an SPI register read
/// (R1 + start token + 16 register bytes + CRC16).
pub const RESPONSE_MAX: usize = 20;

/// Data-block start token used by SPI single-block frames.
const SPI_START_TOKEN: u8 = 0xfe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Command without a response phase.
    None,
    /// Native 48-bit status response.
    R1,
    /// Native 48-bit status response with a busy phase on DAT0.
    R1b,
    /// Native 136-bit register response (CID or CSD).
    R2,
    /// Native 48-bit OCR response; opcode and CRC fields are reserved.
    R3,
    /// Native 48-bit published-RCA response.
    R6,
    /// Native 48-bit interface-condition echo.
    R7,
    /// SPI one-byte status.
    SpiR1,
    /// SPI one-byte status with a busy phase.
    SpiR1b,
    /// SPI two-byte status.
    SpiR2,
    /// SPI status followed by the 32-bit OCR.
    SpiR3,
    /// SPI status followed by the 32-bit echo argument.
    SpiR7,
    /// SPI status followed by an inline register data-block frame.
    SpiRegBlock,
}

/// A framed command response: kind plus the raw frame bytes
/// (0/1/2/5/6/17/20 of them, depending on kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    kind: ResponseKind,
    len: usize,
    buf: [u8; RESPONSE_MAX],
}

impl Response {
    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub(crate) fn none() -> Response {
        Response { kind: ResponseKind::None, len: 0, buf: [0; RESPONSE_MAX] }
    }

    /// A native 48-bit frame: start/transmission bits and opcode, 32-bit
    /// content, CRC7 trailer.
    fn frame48(kind: ResponseKind, opcode: u8, content: u32) -> Response {
        let mut buf = [0u8; RESPONSE_MAX];
        buf[0] = opcode & 0x3f;
        buf[1..5].copy_from_slice(&content.to_be_bytes());
        buf[5] = crc::crc7_trailer(&buf[..5]);
        Response { kind, len: 6, buf }
    }

    pub(crate) fn r1(opcode: u8, status: u32) -> Response {
        Response::frame48(ResponseKind::R1, opcode, status)
    }

    pub(crate) fn r1b(opcode: u8, status: u32) -> Response {
        Response::frame48(ResponseKind::R1b, opcode, status)
    }

    /// A native 136-bit frame: reserved opcode field, then the register
    /// including its own CRC7 trailer byte.
    pub(crate) fn r2(register: &[u8; 16]) -> Response {
        let mut buf = [0u8; RESPONSE_MAX];
        buf[0] = 0x3f;
        buf[1..17].copy_from_slice(register);
        Response { kind: ResponseKind::R2, len: 17, buf }
    }

    /// R3 carries no protection: opcode and trailer fields are all-ones.
    pub(crate) fn r3(ocr: u32) -> Response {
        let mut buf = [0u8; RESPONSE_MAX];
        buf[0] = 0x3f;
        buf[1..5].copy_from_slice(&ocr.to_be_bytes());
        buf[5] = 0xff;
        Response { kind: ResponseKind::R3, len: 6, buf }
    }

    pub(crate) fn r6(rca: u16, status16: u16) -> Response {
        let content = u32::from(rca) << 16 | u32::from(status16);
        Response::frame48(ResponseKind::R6, 3, content)
    }

    pub(crate) fn r7(echo: u32) -> Response {
        Response::frame48(ResponseKind::R7, 8, echo)
    }

    pub(crate) fn spi_r1(status: u8) -> Response {
        let mut buf = [0u8; RESPONSE_MAX];
        buf[0] = status;
        Response { kind: ResponseKind::SpiR1, len: 1, buf }
    }

    pub(crate) fn spi_r1b(status: u8) -> Response {
        let mut r = Response::spi_r1(status);
        r.kind = ResponseKind::SpiR1b;
        r
    }

    pub(crate) fn spi_r2(status: u8, status2: u8) -> Response {
        let mut buf = [0u8; RESPONSE_MAX];
        buf[0] = status;
        buf[1] = status2;
        Response { kind: ResponseKind::SpiR2, len: 2, buf }
    }

    fn spi_with_word(kind: ResponseKind, status: u8, word: u32) -> Response {
        let mut buf = [0u8; RESPONSE_MAX];
        buf[0] = status;
        buf[1..5].copy_from_slice(&word.to_be_bytes());
        Response { kind, len: 5, buf }
    }

    pub(crate) fn spi_r3(status: u8, ocr: u32) -> Response {
        Response::spi_with_word(ResponseKind::SpiR3, status, ocr)
    }

    pub(crate) fn spi_r7(status: u8, echo: u32) -> Response {
        Response::spi_with_word(ResponseKind::SpiR7, status, echo)
    }

    /// SPI register read (CMD9/CMD10): R1, then a single data-block frame
    /// with the 16 register bytes and their CRC16.
    pub(crate) fn spi_reg_block(status: u8, register: &[u8; 16]) -> Response {
        let mut buf = [0u8; RESPONSE_MAX];
        buf[0] = status;
        buf[1] = SPI_START_TOKEN;
        buf[2..18].copy_from_slice(register);
        let crc = crc::crc16(register);
        buf[18..20].copy_from_slice(&crc.to_be_bytes());
        Response { kind: ResponseKind::SpiRegBlock, len: 20, buf }
    }
}

#[test]
fn test_frame_lengths() {
    assert_eq!(Response::none().len(), 0);
    assert_eq!(Response::r1(17, 0x900).len(), 6);
    assert_eq!(Response::r2(&[0u8; 16]).len(), 17);
    assert_eq!(Response::r3(0x80ff8000).len(), 6);
    assert_eq!(Response::spi_r1(0x01).len(), 1);
    assert_eq!(Response::spi_r2(0x00, 0x00).len(), 2);
    assert_eq!(Response::spi_r3(0x00, 0x80ff8000).len(), 5);
    assert_eq!(Response::spi_reg_block(0x00, &[0u8; 16]).len(), 20);
}

#[test]
fn test_r1_trailer_crc() {
    // Response to CMD17 with status 0x0900 is the worked CRC7 example from
    // the SD specification: frame 0x11 00 00 09 00, trailer 0x67.
    let r = Response::r1(17, 0x0900);
    assert_eq!(r.as_bytes()[..5], [0x11, 0x00, 0x00, 0x09, 0x00]);
    assert_eq!(r.as_bytes()[5], (0x33 << 1) | 1);
}

#[test]
fn test_spi_reg_block_layout() {
    let reg = [0xaau8; 16];
    let r = Response::spi_reg_block(0x00, &reg);
    let bytes = r.as_bytes();
    assert_eq!(bytes[0], 0x00);
    assert_eq!(bytes[1], 0xfe);
    assert_eq!(&bytes[2..18], &reg);
    assert_eq!(
        u16::from_be_bytes([bytes[18], bytes[19]]),
        crate::crc::crc16(&reg)
    );
}

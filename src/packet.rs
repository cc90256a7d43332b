use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

/// Capacity of a command packet's data region, in bytes. Every buffer in
/// the dispatch core is sized at compile time; nothing grows past this.
pub const PACKET_DATA_SIZE: usize = 256;

// Wire layout of the General Command Protocol. The request payload and the
// response status share offset 1: replies are encoded in place over the
// request, as the flight heritage protocol does.
pub const SUBSERVICE_BYTE: usize = 0;
pub const STATUS_BYTE: usize = 1;
pub const IN_DATA_BYTE: usize = 1;
pub const OUT_DATA_BYTE: usize = 2;

/// Reply length is always `REPLY_OVERHEAD + payload`: one subservice byte
/// plus one status byte, then whatever output the subservice produced.
pub const REPLY_OVERHEAD: usize = 2;

const_assert!(STATUS_BYTE == SUBSERVICE_BYTE + 1);
const_assert!(OUT_DATA_BYTE == STATUS_BYTE + 1);
const_assert!(REPLY_OVERHEAD == OUT_DATA_BYTE);
const_assert!(PACKET_DATA_SIZE > REPLY_OVERHEAD);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    TooLarge,
    Overrun,
}

impl core::fmt::Display for PacketError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PacketError::TooLarge => write!(f, "Payload exceeds packet capacity"),
            PacketError::Overrun => write!(f, "Write exceeds remaining packet capacity"),
        }
    }
}

impl std::error::Error for PacketError {}

/// Well-known destination ports served by queues or the general
/// interpreter. Unmatched ports fall through to the transport's built-in
/// handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServicePort {
    TimeManagement,
    Housekeeping,
    General,
}

impl ServicePort {
    pub const fn number(self) -> u8 {
        match self {
            ServicePort::TimeManagement => 8,
            ServicePort::Housekeeping => 9,
            ServicePort::General => 11,
        }
    }

    pub fn from_number(port: u8) -> Option<Self> {
        match port {
            8 => Some(ServicePort::TimeManagement),
            9 => Some(ServicePort::Housekeeping),
            11 => Some(ServicePort::General),
            _ => None,
        }
    }
}

/// A telecommand packet: destination port plus a fixed-capacity data
/// buffer with an explicit length. Owned by exactly one handler at a time;
/// replies overwrite the request in place.
#[derive(Debug, Clone)]
pub struct CmdPacket {
    dst_port: u8,
    len: usize,
    data: [u8; PACKET_DATA_SIZE],
}

impl CmdPacket {
    /// Wrap raw frame data read off the transport.
    pub fn from_bytes(dst_port: u8, bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() > PACKET_DATA_SIZE {
            return Err(PacketError::TooLarge);
        }
        let mut data = [0u8; PACKET_DATA_SIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            dst_port,
            len: bytes.len(),
            data,
        })
    }

    /// Build a request packet (client side and tests).
    pub fn request(dst_port: u8, subservice: u8, payload: &[u8]) -> Result<Self, PacketError> {
        if payload.len() + 1 > PACKET_DATA_SIZE {
            return Err(PacketError::TooLarge);
        }
        let mut data = [0u8; PACKET_DATA_SIZE];
        data[SUBSERVICE_BYTE] = subservice;
        data[IN_DATA_BYTE..IN_DATA_BYTE + payload.len()].copy_from_slice(payload);
        Ok(Self {
            dst_port,
            len: payload.len() + 1,
            data,
        })
    }

    pub fn dst_port(&self) -> u8 {
        self.dst_port
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn subservice(&self) -> Option<u8> {
        self.as_bytes().get(SUBSERVICE_BYTE).copied()
    }

    /// Request payload, beginning right after the subservice byte.
    pub fn in_data(&self) -> &[u8] {
        if self.len > IN_DATA_BYTE {
            &self.data[IN_DATA_BYTE..self.len]
        } else {
            &[]
        }
    }

    /// Copy a fixed-size output payload into the reply region.
    pub fn write_out(&mut self, payload: &[u8]) -> Result<(), PacketError> {
        if OUT_DATA_BYTE + payload.len() > PACKET_DATA_SIZE {
            return Err(PacketError::Overrun);
        }
        self.data[OUT_DATA_BYTE..OUT_DATA_BYTE + payload.len()].copy_from_slice(payload);
        Ok(())
    }

    /// Bounded writer over the reply payload region; tracks remaining
    /// capacity and fails closed when exhausted.
    pub fn reply_writer(&mut self) -> BoundedWriter<'_> {
        BoundedWriter::new(&mut self.data[OUT_DATA_BYTE..])
    }

    /// Seal the in-place reply: write the status byte and set the packet
    /// length to cover subservice + status + `payload_len` output bytes.
    pub fn finish_reply(&mut self, status: i8, payload_len: usize) -> Result<(), PacketError> {
        if REPLY_OVERHEAD + payload_len > PACKET_DATA_SIZE {
            return Err(PacketError::Overrun);
        }
        self.data[STATUS_BYTE] = status as u8;
        self.len = REPLY_OVERHEAD + payload_len;
        Ok(())
    }

    // Reply-side accessors, used by the ground client and tests.

    pub fn status(&self) -> Option<i8> {
        self.as_bytes().get(STATUS_BYTE).map(|&b| b as i8)
    }

    pub fn out_data(&self) -> &[u8] {
        if self.len > OUT_DATA_BYTE {
            &self.data[OUT_DATA_BYTE..self.len]
        } else {
            &[]
        }
    }
}

/// Writer over a fixed slice that refuses any write it cannot take whole.
#[derive(Debug)]
pub struct BoundedWriter<'a> {
    buf: &'a mut [u8],
    written: usize,
}

impl<'a> BoundedWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.written
    }

    /// All-or-nothing append. On `Overrun` the buffer is untouched, so a
    /// caller serializing records can stop cleanly at a record boundary.
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), PacketError> {
        if bytes.len() > self.remaining() {
            return Err(PacketError::Overrun);
        }
        self.buf[self.written..self.written + bytes.len()].copy_from_slice(bytes);
        self.written += bytes.len();
        Ok(())
    }
}

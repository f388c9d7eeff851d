/// Link cells and relay cell bodies
///
/// A cell is a circuit id, a command byte and a payload. Fixed-length cells
/// carry exactly 509 payload bytes; VERSIONS and commands >= 128 carry a
/// 2-byte length instead.
use minitor_common::config::protocol::{CELL_PAYLOAD_LEN, RELAY_DATA_LEN, RELAY_HEADER_LEN};
use minitor_common::{Result, TorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellCommand {
    Padding,
    Create,
    Created,
    Relay,
    Destroy,
    CreateFast,
    CreatedFast,
    Versions,
    Netinfo,
    RelayEarly,
    Create2,
    Created2,
    Vpadding,
    Certs,
    AuthChallenge,
    Authenticate,
    Unknown(u8),
}

impl CellCommand {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Padding,
            1 => Self::Create,
            2 => Self::Created,
            3 => Self::Relay,
            4 => Self::Destroy,
            5 => Self::CreateFast,
            6 => Self::CreatedFast,
            7 => Self::Versions,
            8 => Self::Netinfo,
            9 => Self::RelayEarly,
            10 => Self::Create2,
            11 => Self::Created2,
            128 => Self::Vpadding,
            129 => Self::Certs,
            130 => Self::AuthChallenge,
            131 => Self::Authenticate,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Padding => 0,
            Self::Create => 1,
            Self::Created => 2,
            Self::Relay => 3,
            Self::Destroy => 4,
            Self::CreateFast => 5,
            Self::CreatedFast => 6,
            Self::Versions => 7,
            Self::Netinfo => 8,
            Self::RelayEarly => 9,
            Self::Create2 => 10,
            Self::Created2 => 11,
            Self::Vpadding => 128,
            Self::Certs => 129,
            Self::AuthChallenge => 130,
            Self::Authenticate => 131,
            Self::Unknown(value) => value,
        }
    }

    /// Variable-length cells carry a 2-byte payload length
    pub fn is_variable_length(self) -> bool {
        let value = self.as_u8();
        value == 7 || value >= 128
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayCommand {
    Begin,
    Data,
    End,
    Connected,
    Sendme,
    Extend,
    Extended,
    Truncate,
    Truncated,
    Drop,
    Resolve,
    Resolved,
    BeginDir,
    Extend2,
    Extended2,
    EstablishRendezvous,
    Introduce1,
    Rendezvous2,
    RendezvousEstablished,
    IntroduceAck,
    Unknown(u8),
}

impl RelayCommand {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Begin,
            2 => Self::Data,
            3 => Self::End,
            4 => Self::Connected,
            5 => Self::Sendme,
            6 => Self::Extend,
            7 => Self::Extended,
            8 => Self::Truncate,
            9 => Self::Truncated,
            10 => Self::Drop,
            11 => Self::Resolve,
            12 => Self::Resolved,
            13 => Self::BeginDir,
            14 => Self::Extend2,
            15 => Self::Extended2,
            33 => Self::EstablishRendezvous,
            34 => Self::Introduce1,
            37 => Self::Rendezvous2,
            39 => Self::RendezvousEstablished,
            40 => Self::IntroduceAck,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Begin => 1,
            Self::Data => 2,
            Self::End => 3,
            Self::Connected => 4,
            Self::Sendme => 5,
            Self::Extend => 6,
            Self::Extended => 7,
            Self::Truncate => 8,
            Self::Truncated => 9,
            Self::Drop => 10,
            Self::Resolve => 11,
            Self::Resolved => 12,
            Self::BeginDir => 13,
            Self::Extend2 => 14,
            Self::Extended2 => 15,
            Self::EstablishRendezvous => 33,
            Self::Introduce1 => 34,
            Self::Rendezvous2 => 37,
            Self::RendezvousEstablished => 39,
            Self::IntroduceAck => 40,
            Self::Unknown(value) => value,
        }
    }
}

/// A link-level cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub circ_id: u32,
    pub command: CellCommand,
    pub payload: Vec<u8>,
}

impl Cell {
    pub fn new(circ_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circ_id,
            command,
            payload,
        }
    }

    /// Serializes with a 4-byte circuit id, padding fixed cells to 509 bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(7 + self.payload.len().max(CELL_PAYLOAD_LEN));
        out.extend_from_slice(&self.circ_id.to_be_bytes());
        out.push(self.command.as_u8());

        if self.command.is_variable_length() {
            let len = u16::try_from(self.payload.len())
                .map_err(|_| TorError::protocol("variable cell payload too long"))?;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(&self.payload);
        } else {
            if self.payload.len() > CELL_PAYLOAD_LEN {
                return Err(TorError::protocol(format!(
                    "cell payload of {} bytes exceeds {CELL_PAYLOAD_LEN}",
                    self.payload.len()
                )));
            }
            out.extend_from_slice(&self.payload);
            out.resize(4 + 1 + CELL_PAYLOAD_LEN, 0);
        }
        Ok(out)
    }

    /// Parses one cell from the front of `data`, returning it and the bytes consumed
    ///
    /// `Ok(None)` means more input is needed.
    pub fn parse(data: &[u8]) -> Result<Option<(Self, usize)>> {
        if data.len() < 5 {
            return Ok(None);
        }
        let circ_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let command = CellCommand::from_u8(data[4]);

        if command.is_variable_length() {
            if data.len() < 7 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([data[5], data[6]]) as usize;
            if data.len() < 7 + len {
                return Ok(None);
            }
            let payload = data[7..7 + len].to_vec();
            Ok(Some((Self::new(circ_id, command, payload), 7 + len)))
        } else {
            let total = 5 + CELL_PAYLOAD_LEN;
            if data.len() < total {
                return Ok(None);
            }
            let payload = data[5..total].to_vec();
            Ok(Some((Self::new(circ_id, command, payload), total)))
        }
    }
}

/// A relay cell body before encryption or after decryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub command: RelayCommand,
    pub stream_id: u16,
    pub data: Vec<u8>,
}

impl RelayMessage {
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        Self {
            command,
            stream_id,
            data,
        }
    }

    /// Lays out the 509-byte relay payload with zeroed recognized and digest fields
    pub fn encode(&self) -> Result<[u8; CELL_PAYLOAD_LEN]> {
        if self.data.len() > RELAY_DATA_LEN {
            return Err(TorError::protocol(format!(
                "relay data of {} bytes exceeds {RELAY_DATA_LEN}",
                self.data.len()
            )));
        }
        let mut payload = [0u8; CELL_PAYLOAD_LEN];
        payload[0] = self.command.as_u8();
        payload[3..5].copy_from_slice(&self.stream_id.to_be_bytes());
        payload[9..11].copy_from_slice(&(self.data.len() as u16).to_be_bytes());
        payload[RELAY_HEADER_LEN..RELAY_HEADER_LEN + self.data.len()].copy_from_slice(&self.data);
        Ok(payload)
    }

    /// Reads a recognized relay payload
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < RELAY_HEADER_LEN {
            return Err(TorError::protocol("relay payload shorter than its header"));
        }
        let command = RelayCommand::from_u8(payload[0]);
        let stream_id = u16::from_be_bytes([payload[3], payload[4]]);
        let len = u16::from_be_bytes([payload[9], payload[10]]) as usize;
        if len > RELAY_DATA_LEN || RELAY_HEADER_LEN + len > payload.len() {
            return Err(TorError::protocol(format!("relay length {len} out of range")));
        }
        Ok(Self::new(
            command,
            stream_id,
            payload[RELAY_HEADER_LEN..RELAY_HEADER_LEN + len].to_vec(),
        ))
    }
}

/// Byte range of the recognized field in a relay payload
pub const RECOGNIZED_RANGE: std::ops::Range<usize> = 1..3;

/// Byte range of the running digest in a relay payload
pub const DIGEST_RANGE: std::ops::Range<usize> = 5..9;

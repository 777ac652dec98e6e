#![forbid(unsafe_code)]

//! GameSpy NatNeg wire-format codec.
//!
//! NatNeg datagrams share an 8-byte header (6-byte magic, version, step);
//! everything past the header depends on the step. This crate only inspects
//! the fields the proxy needs: the session identifiers and the embedded
//! address of `connect`/`connectPing` packets, which the proxy rewrites in
//! place. All inspection is over borrowed slices; callers copy when they
//! need an owned buffer.

use std::net::Ipv4Addr;

/// Magic prefix of every NatNeg datagram.
pub const NATNEG_MAGIC: [u8; 6] = [0xFD, 0xFC, 0x1E, 0x66, 0x6A, 0xB2];

/// Minimum NatNeg length: magic + version byte + step byte.
pub const NATNEG_HEADER_LEN: usize = 8;

pub const STEP_OFFSET: usize = 7;
pub const NATNEG_ID_OFFSET: usize = 8;

/// Offset of the init packet's sequence number (the "port type" byte).
pub const INIT_SEQUENCE_OFFSET: usize = 12;

/// Offset of the embedded IPv4+port field in `connect`/`connectPing`.
pub const ADDRESS_OFFSET: usize = 12;

/// Length of an embedded address field: 4 IPv4 octets + big-endian port.
pub const ADDRESS_FIELD_LEN: usize = 6;

/// NatNeg sub-message classifier, byte at offset 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Step {
    Init = 0,
    InitAck = 1,
    Connect = 5,
    ConnectAck = 6,
    ConnectPing = 7,
    Report = 13,
    ReportAck = 14,
    PreInit = 15,
    PreInitAck = 16,
}

impl Step {
    pub fn from_byte(byte: u8) -> Option<Step> {
        match byte {
            0 => Some(Step::Init),
            1 => Some(Step::InitAck),
            5 => Some(Step::Connect),
            6 => Some(Step::ConnectAck),
            7 => Some(Step::ConnectPing),
            13 => Some(Step::Report),
            14 => Some(Step::ReportAck),
            15 => Some(Step::PreInit),
            16 => Some(Step::PreInitAck),
            _ => None,
        }
    }

    /// Steps that carry a NatNegID at offset 8. Note that `preInit` and
    /// `preInitAck` do not, even though they carry a player ID byte.
    pub fn has_nat_neg_id(self) -> bool {
        matches!(
            self,
            Step::Init
                | Step::InitAck
                | Step::Connect
                | Step::ConnectAck
                | Step::ConnectPing
                | Step::Report
                | Step::ReportAck
        )
    }

    /// Offset of the player-ID byte, where the step has one.
    pub fn player_id_offset(self) -> Option<usize> {
        match self {
            Step::Init | Step::InitAck | Step::ConnectAck | Step::Report | Step::ReportAck => {
                Some(13)
            }
            Step::PreInit | Step::PreInitAck => Some(12),
            Step::Connect | Step::ConnectPing => None,
        }
    }

    /// Offset of the embedded peer address, where the step has one.
    pub fn address_offset(self) -> Option<usize> {
        match self {
            Step::Connect | Step::ConnectPing => Some(ADDRESS_OFFSET),
            _ => None,
        }
    }
}

impl core::fmt::Display for Step {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Step::Init => "init",
            Step::InitAck => "initAck",
            Step::Connect => "connect",
            Step::ConnectAck => "connectAck",
            Step::ConnectPing => "connectPing",
            Step::Report => "report",
            Step::ReportAck => "reportAck",
            Step::PreInit => "preInit",
            Step::PreInitAck => "preInitAck",
        };
        f.write_str(name)
    }
}

/// Negotiation identifier at offset 8, little-endian on the wire.
pub type NatNegId = u32;

/// Composite session key: one `(NatNegID, PlayerID)` pair identifies one
/// in-flight negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NatNegPlayerId {
    pub nat_neg_id: NatNegId,
    pub player_id: i8,
}

impl core::fmt::Display for NatNegPlayerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{}:{}]", self.nat_neg_id, self.player_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    TooShort { len: usize, min: usize },
    InvalidMagic,
    UnknownStep { step: u8 },
}

impl core::fmt::Display for PacketError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PacketError::TooShort { len, min } => {
                write!(f, "packet too short: {len} < {min}")
            }
            PacketError::InvalidMagic => write!(f, "invalid NatNeg magic"),
            PacketError::UnknownStep { step } => write!(f, "unknown step: 0x{step:02x}"),
        }
    }
}

impl std::error::Error for PacketError {}

/// True iff the buffer is long enough to be NatNeg and starts with the magic.
pub fn is_nat_neg(buf: &[u8]) -> bool {
    buf.len() >= NATNEG_HEADER_LEN && buf.starts_with(&NATNEG_MAGIC)
}

pub fn step(buf: &[u8]) -> Result<Step, PacketError> {
    if !is_nat_neg(buf) {
        return Err(PacketError::InvalidMagic);
    }
    let byte = buf[STEP_OFFSET];
    Step::from_byte(byte).ok_or(PacketError::UnknownStep { step: byte })
}

/// NatNegID of the packet, if this step carries one.
pub fn nat_neg_id(buf: &[u8]) -> Result<Option<NatNegId>, PacketError> {
    if !step(buf)?.has_nat_neg_id() {
        return Ok(None);
    }
    let end = NATNEG_ID_OFFSET + 4;
    if buf.len() < end {
        return Err(PacketError::TooShort {
            len: buf.len(),
            min: end,
        });
    }
    Ok(Some(NatNegId::from_le_bytes([
        buf[NATNEG_ID_OFFSET],
        buf[NATNEG_ID_OFFSET + 1],
        buf[NATNEG_ID_OFFSET + 2],
        buf[NATNEG_ID_OFFSET + 3],
    ])))
}

/// Session key of the packet, if this step carries both a NatNegID and a
/// player ID.
pub fn player_id(buf: &[u8]) -> Result<Option<NatNegPlayerId>, PacketError> {
    let Some(nat_neg_id) = nat_neg_id(buf)? else {
        return Ok(None);
    };
    let Some(offset) = step(buf)?.player_id_offset() else {
        return Ok(None);
    };
    let Some(&byte) = buf.get(offset) else {
        return Err(PacketError::TooShort {
            len: buf.len(),
            min: offset + 1,
        });
    };
    Ok(Some(NatNegPlayerId {
        nat_neg_id,
        player_id: byte as i8,
    }))
}

/// Sequence number of an `init` packet, `None` for every other step.
pub fn init_sequence(buf: &[u8]) -> Result<Option<u8>, PacketError> {
    if step(buf)? != Step::Init {
        return Ok(None);
    }
    match buf.get(INIT_SEQUENCE_OFFSET) {
        Some(&byte) => Ok(Some(byte)),
        None => Err(PacketError::TooShort {
            len: buf.len(),
            min: INIT_SEQUENCE_OFFSET + 1,
        }),
    }
}

/// Read the embedded address field: 4 IPv4 octets followed by a big-endian
/// port. The port is returned in host order.
pub fn parse_address(buf: &[u8], offset: usize) -> Result<(Ipv4Addr, u16), PacketError> {
    let end = offset + ADDRESS_FIELD_LEN;
    let Some(field) = buf.get(offset..end) else {
        return Err(PacketError::TooShort {
            len: buf.len(),
            min: end,
        });
    };
    let ip = Ipv4Addr::new(field[0], field[1], field[2], field[3]);
    let port = u16::from_be_bytes([field[4], field[5]]);
    Ok((ip, port))
}

/// Overwrite the embedded address field in place. The port is written
/// big-endian.
pub fn rewrite_address(
    buf: &mut [u8],
    offset: usize,
    ip: Ipv4Addr,
    port: u16,
) -> Result<(), PacketError> {
    let end = offset + ADDRESS_FIELD_LEN;
    let len = buf.len();
    let Some(field) = buf.get_mut(offset..end) else {
        return Err(PacketError::TooShort { len, min: end });
    };
    field[..4].copy_from_slice(&ip.octets());
    field[4..6].copy_from_slice(&port.to_be_bytes());
    Ok(())
}

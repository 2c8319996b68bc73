// src/wire.rs
//
// On-wire framing. Every frame is a fixed 8-byte header (magic u32, command
// u16, payload length u16, all network byte order) followed by a
// command-specific payload. Follows the same hand-rolled
// to_be_bytes/from_be_bytes technique used for the replay protocol's
// [len:u32][seq:u64] header, generalized into a reusable encode/decode pair
// so it can be driven over any `Read + Write`, not just a live socket.

use crate::error::DrbdError;
use std::io::{Read, Write};

pub const MAGIC: u32 = 0x8620_1267; // arbitrary, stable across this crate's wire version
const HEADER_LEN: usize = 8;
const MAX_PAYLOAD: u16 = u16::MAX;

/// This node's protocol version, carried in `Parameter::version` during
/// `ReportParams`. A peer reporting a version below this may still be
/// spoken to, just not sent opt-in (`>= MAY_IGNORE`) commands.
pub const PROTOCOL_VERSION: u32 = 2;

/// Lowest peer version that understands `Command::Csum`.
pub const CSUM_MIN_VERSION: u32 = 2;

/// Commands, in the order the original protocol assigns them. Values
/// `>= MAY_IGNORE` are opt-in: an older peer is allowed to not understand
/// them, so senders must gate use behind a version check established
/// during `ReportParams`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    Data = 0,
    DataReply = 1,
    RecvAck = 2,
    WriteAck = 3,
    Barrier = 4,
    BarrierAck = 5,
    ReportParams = 6,
    ReportBitMap = 7,
    Ping = 8,
    PingAck = 9,
    BecomeSyncTarget = 10,
    BecomeSyncSource = 11,
    BecomeSec = 12,
    WriteHint = 13,
    DataRequest = 14,
    RSDataRequest = 15,
    BlockInSync = 16,
    SetSyncParam = 17,
    SyncStop = 18,
    SyncCont = 19,
    /// Opt-in: announces a resync block by checksum instead of transmitting
    /// it outright. Gated behind the peer's `version` field from
    /// `ReportParams` (see `Open Questions` in the design notes) since an
    /// older peer is not required to understand it.
    Csum = 0x100,
}

pub const MAY_IGNORE: u16 = 0x100;

impl Command {
    pub fn from_u16(v: u16) -> Option<Command> {
        use Command::*;
        Some(match v {
            0 => Data,
            1 => DataReply,
            2 => RecvAck,
            3 => WriteAck,
            4 => Barrier,
            5 => BarrierAck,
            6 => ReportParams,
            7 => ReportBitMap,
            8 => Ping,
            9 => PingAck,
            10 => BecomeSyncTarget,
            11 => BecomeSyncSource,
            12 => BecomeSec,
            13 => WriteHint,
            14 => DataRequest,
            15 => RSDataRequest,
            16 => BlockInSync,
            17 => SetSyncParam,
            18 => SyncStop,
            19 => SyncCont,
            0x100 => Csum,
            _ => return None,
        })
    }

    #[inline]
    pub fn is_opt_in(self) -> bool {
        (self as u16) >= MAY_IGNORE
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub command: Command,
    pub length: u16,
}

pub fn write_header<W: Write>(w: &mut W, command: Command, length: u16) -> Result<(), DrbdError> {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
    buf[4..6].copy_from_slice(&(command as u16).to_be_bytes());
    buf[6..8].copy_from_slice(&length.to_be_bytes());
    w.write_all(&buf)?;
    Ok(())
}

pub fn read_header<R: Read>(r: &mut R) -> Result<Header, DrbdError> {
    let mut buf = [0u8; HEADER_LEN];
    r.read_exact(&mut buf)?;
    let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(DrbdError::protocol(format!("bad magic: {magic:#x}")));
    }
    let cmd_raw = u16::from_be_bytes(buf[4..6].try_into().unwrap());
    let length = u16::from_be_bytes(buf[6..8].try_into().unwrap());
    let command = Command::from_u16(cmd_raw)
        .ok_or_else(|| DrbdError::protocol(format!("unknown command {cmd_raw}")))?;
    Ok(Header { command, length })
}

/// Write a full frame: header followed by `payload`. Fails if the payload
/// would not fit in the 16-bit length field.
pub fn write_frame<W: Write>(w: &mut W, command: Command, payload: &[u8]) -> Result<(), DrbdError> {
    if payload.len() as u64 > MAX_PAYLOAD as u64 {
        return Err(DrbdError::protocol("payload too large for frame"));
    }
    write_header(w, command, payload.len() as u16)?;
    if !payload.is_empty() {
        w.write_all(payload)?;
    }
    Ok(())
}

pub fn read_frame<R: Read>(r: &mut R) -> Result<(Command, Vec<u8>), DrbdError> {
    let hdr = read_header(r)?;
    let mut payload = vec![0u8; hdr.length as usize];
    if hdr.length > 0 {
        r.read_exact(&mut payload)?;
    }
    Ok((hdr.command, payload))
}

// --------------------------- Payload shapes -----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub sector: u64,
    pub block_id: u64,
}

impl DataHeader {
    pub const LEN: usize = 16;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..8].copy_from_slice(&self.sector.to_be_bytes());
        out[8..16].copy_from_slice(&self.block_id.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DrbdError> {
        if buf.len() < Self::LEN {
            return Err(DrbdError::protocol("data header truncated"));
        }
        Ok(Self {
            sector: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            block_id: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAck {
    pub sector: u64,
    pub block_id: u64,
    pub blksize: u32,
}

impl BlockAck {
    pub const LEN: usize = 20;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..8].copy_from_slice(&self.sector.to_be_bytes());
        out[8..16].copy_from_slice(&self.block_id.to_be_bytes());
        out[16..20].copy_from_slice(&self.blksize.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DrbdError> {
        if buf.len() < Self::LEN {
            return Err(DrbdError::protocol("block ack truncated"));
        }
        Ok(Self {
            sector: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            block_id: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            blksize: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierPacket {
    pub barrier: u32,
}

impl BarrierPacket {
    pub const LEN: usize = 4;
    pub fn encode(&self) -> [u8; Self::LEN] {
        self.barrier.to_be_bytes()
    }
    pub fn decode(buf: &[u8]) -> Result<Self, DrbdError> {
        if buf.len() < Self::LEN {
            return Err(DrbdError::protocol("barrier packet truncated"));
        }
        Ok(Self { barrier: u32::from_be_bytes(buf[0..4].try_into().unwrap()) })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierAck {
    pub barrier: u32,
    pub set_size: u32,
}

impl BarrierAck {
    pub const LEN: usize = 8;
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&self.barrier.to_be_bytes());
        out[4..8].copy_from_slice(&self.set_size.to_be_bytes());
        out
    }
    pub fn decode(buf: &[u8]) -> Result<Self, DrbdError> {
        if buf.len() < Self::LEN {
            return Err(DrbdError::protocol("barrier ack truncated"));
        }
        Ok(Self {
            barrier: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            set_size: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
        })
    }
}

pub const GEN_CNT_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncParam {
    pub rate: u32,
    pub use_csums: u32,
    pub skip: u32,
    pub group: u32,
}

impl SyncParam {
    pub const LEN: usize = 16;
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&self.rate.to_be_bytes());
        out[4..8].copy_from_slice(&self.use_csums.to_be_bytes());
        out[8..12].copy_from_slice(&self.skip.to_be_bytes());
        out[12..16].copy_from_slice(&self.group.to_be_bytes());
        out
    }
    pub fn decode(buf: &[u8]) -> Result<Self, DrbdError> {
        if buf.len() < Self::LEN {
            return Err(DrbdError::protocol("sync param truncated"));
        }
        Ok(Self {
            rate: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            use_csums: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            skip: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            group: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub p_size: u64,
    pub u_size: u64,
    pub protocol: u32,
    pub version: u32,
    pub gen_cnt: [u32; GEN_CNT_SIZE],
    pub bit_map_gen: [u32; GEN_CNT_SIZE],
    pub sync_rate: u32,
}

impl Parameter {
    pub const LEN: usize = 8 + 8 + 4 + 4 + GEN_CNT_SIZE * 4 + GEN_CNT_SIZE * 4 + 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.p_size.to_be_bytes());
        out.extend_from_slice(&self.u_size.to_be_bytes());
        out.extend_from_slice(&self.protocol.to_be_bytes());
        out.extend_from_slice(&self.version.to_be_bytes());
        for g in &self.gen_cnt {
            out.extend_from_slice(&g.to_be_bytes());
        }
        for g in &self.bit_map_gen {
            out.extend_from_slice(&g.to_be_bytes());
        }
        out.extend_from_slice(&self.sync_rate.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DrbdError> {
        if buf.len() < Self::LEN {
            return Err(DrbdError::protocol("parameter packet truncated"));
        }
        let mut off = 0usize;
        let mut take8 = |b: &[u8]| -> u64 {
            let v = u64::from_be_bytes(b[off..off + 8].try_into().unwrap());
            off += 8;
            v
        };
        let p_size = take8(buf);
        let u_size = take8(buf);
        let mut take4 = |b: &[u8]| -> u32 {
            let v = u32::from_be_bytes(b[off..off + 4].try_into().unwrap());
            off += 4;
            v
        };
        let protocol = take4(buf);
        let version = take4(buf);
        let mut gen_cnt = [0u32; GEN_CNT_SIZE];
        for g in gen_cnt.iter_mut() {
            *g = take4(buf);
        }
        let mut bit_map_gen = [0u32; GEN_CNT_SIZE];
        for g in bit_map_gen.iter_mut() {
            *g = take4(buf);
        }
        let sync_rate = take4(buf);
        Ok(Self { p_size, u_size, protocol, version, gen_cnt, bit_map_gen, sync_rate })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub sector: u64,
    pub block_id: u64,
    pub blksize: u32,
}

impl BlockRequest {
    pub const LEN: usize = 20;
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..8].copy_from_slice(&self.sector.to_be_bytes());
        out[8..16].copy_from_slice(&self.block_id.to_be_bytes());
        out[16..20].copy_from_slice(&self.blksize.to_be_bytes());
        out
    }
    pub fn decode(buf: &[u8]) -> Result<Self, DrbdError> {
        if buf.len() < Self::LEN {
            return Err(DrbdError::protocol("block request truncated"));
        }
        Ok(Self {
            sector: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            block_id: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            blksize: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumBlock {
    pub sector: u64,
    pub block_id: u64,
    pub blksize: u32,
    pub csum: u64,
}

impl ChecksumBlock {
    pub const LEN: usize = 28;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..8].copy_from_slice(&self.sector.to_be_bytes());
        out[8..16].copy_from_slice(&self.block_id.to_be_bytes());
        out[16..20].copy_from_slice(&self.blksize.to_be_bytes());
        out[20..28].copy_from_slice(&self.csum.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DrbdError> {
        if buf.len() < Self::LEN {
            return Err(DrbdError::protocol("checksum block truncated"));
        }
        Ok(Self {
            sector: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            block_id: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            blksize: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
            csum: u64::from_be_bytes(buf[20..28].try_into().unwrap()),
        })
    }
}

/// A decoded frame: command tag plus payload, decoded into a sum type
/// rather than left as a shared header + raw bytes.
#[derive(Debug, Clone)]
pub enum Packet {
    Data { header: DataHeader, block: Vec<u8> },
    DataReply { header: DataHeader, block: Vec<u8> },
    RecvAck(BlockAck),
    WriteAck(BlockAck),
    Barrier(BarrierPacket),
    BarrierAck(BarrierAck),
    ReportParams(Parameter),
    ReportBitMap(Vec<u8>),
    Ping,
    PingAck,
    BecomeSyncTarget,
    BecomeSyncSource,
    BecomeSec,
    WriteHint,
    DataRequest(BlockRequest),
    RSDataRequest(BlockRequest),
    BlockInSync(BlockAck),
    SetSyncParam(SyncParam),
    SyncStop,
    SyncCont,
    Csum(ChecksumBlock),
}

impl Packet {
    pub fn decode(command: Command, payload: &[u8]) -> Result<Packet, DrbdError> {
        Ok(match command {
            Command::Data => {
                let header = DataHeader::decode(payload)?;
                Packet::Data { header, block: payload[DataHeader::LEN..].to_vec() }
            }
            Command::DataReply => {
                let header = DataHeader::decode(payload)?;
                Packet::DataReply { header, block: payload[DataHeader::LEN..].to_vec() }
            }
            Command::RecvAck => Packet::RecvAck(BlockAck::decode(payload)?),
            Command::WriteAck => Packet::WriteAck(BlockAck::decode(payload)?),
            Command::Barrier => Packet::Barrier(BarrierPacket::decode(payload)?),
            Command::BarrierAck => Packet::BarrierAck(BarrierAck::decode(payload)?),
            Command::ReportParams => Packet::ReportParams(Parameter::decode(payload)?),
            Command::ReportBitMap => Packet::ReportBitMap(payload.to_vec()),
            Command::Ping => Packet::Ping,
            Command::PingAck => Packet::PingAck,
            Command::BecomeSyncTarget => Packet::BecomeSyncTarget,
            Command::BecomeSyncSource => Packet::BecomeSyncSource,
            Command::BecomeSec => Packet::BecomeSec,
            Command::WriteHint => Packet::WriteHint,
            Command::DataRequest => Packet::DataRequest(BlockRequest::decode(payload)?),
            Command::RSDataRequest => Packet::RSDataRequest(BlockRequest::decode(payload)?),
            Command::BlockInSync => Packet::BlockInSync(BlockAck::decode(payload)?),
            Command::SetSyncParam => Packet::SetSyncParam(SyncParam::decode(payload)?),
            Command::SyncStop => Packet::SyncStop,
            Command::SyncCont => Packet::SyncCont,
            Command::Csum => Packet::Csum(ChecksumBlock::decode(payload)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_round_trips() {
        let mut buf = Vec::new();
        write_header(&mut buf, Command::BarrierAck, 8).unwrap();
        let mut cur = Cursor::new(buf);
        let hdr = read_header(&mut cur).unwrap();
        assert_eq!(hdr.command, Command::BarrierAck);
        assert_eq!(hdr.length, 8);
    }

    #[test]
    fn bad_magic_is_protocol_violation() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&0u32.to_be_bytes());
        let mut cur = Cursor::new(buf);
        let err = read_header(&mut cur).unwrap_err();
        assert!(matches!(err, DrbdError::ProtocolViolation { .. }));
    }

    #[test]
    fn data_frame_round_trips_through_packet() {
        let header = DataHeader { sector: 42, block_id: 7 };
        let block = vec![0xAAu8; 4096];
        let mut payload = header.encode().to_vec();
        payload.extend_from_slice(&block);

        let mut buf = Vec::new();
        write_frame(&mut buf, Command::Data, &payload).unwrap();

        let mut cur = Cursor::new(buf);
        let (cmd, payload) = read_frame(&mut cur).unwrap();
        assert_eq!(cmd, Command::Data);
        let pkt = Packet::decode(cmd, &payload).unwrap();
        match pkt {
            Packet::Data { header: h, block: b } => {
                assert_eq!(h, header);
                assert_eq!(b, block);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn barrier_ack_round_trips() {
        let ack = BarrierAck { barrier: 3, set_size: 12 };
        let mut buf = Vec::new();
        write_frame(&mut buf, Command::BarrierAck, &ack.encode()).unwrap();
        let mut cur = Cursor::new(buf);
        let (cmd, payload) = read_frame(&mut cur).unwrap();
        let pkt = Packet::decode(cmd, &payload).unwrap();
        assert!(matches!(pkt, Packet::BarrierAck(a) if a == ack));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let err = BlockAck::decode(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, DrbdError::ProtocolViolation { .. }));
    }

    #[test]
    fn opt_in_commands_are_identified() {
        assert!(!Command::Data.is_opt_in());
        assert!(MAY_IGNORE > Command::SyncCont as u16);
        assert!(Command::Csum.is_opt_in());
    }

    #[test]
    fn checksum_block_round_trips_through_packet() {
        let csum = ChecksumBlock { sector: 512, block_id: 9, blksize: 4096, csum: 0xdead_beef_cafe_1234 };
        let mut buf = Vec::new();
        write_frame(&mut buf, Command::Csum, &csum.encode()).unwrap();
        let mut cur = Cursor::new(buf);
        let (cmd, payload) = read_frame(&mut cur).unwrap();
        assert_eq!(cmd, Command::Csum);
        let pkt = Packet::decode(cmd, &payload).unwrap();
        assert!(matches!(pkt, Packet::Csum(c) if c == csum));
    }
}

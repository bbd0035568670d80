// Wire-level parsing and serialization of MCTP frames.
//
// Frame layout, all multi-byte integers little-endian:
//
//   | kind: u8 | data_size: u16 | reserved: 5 bytes | payload | EOM: 3 bytes |
//
// The payload of a DATA frame is a channel count followed by one
// descriptor + sample block per channel:
//
//   | n_of_channels: u8 |
//   | channel_id: u8 | channel_bytes: u16 | data_type: u8 | samples... |

use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeMap;
use thiserror::Error;

/// End-of-message delimiter closing every frame.
pub const EOM: [u8; 3] = [0x24, 0x25, 0x26];
pub const HEADER_SIZE: usize = 8;
pub const DATAINFO_SIZE: usize = 4;
/// Header plus EOM, no payload.
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + EOM.len();
pub const MAX_CHANNELS: u8 = 32;

/// The reserved header bytes carry no meaning; the controller emits this
/// filler and ignores whatever the performer sends there.
const RESERVED_FILL: u8 = 0x05;
const RESERVED_LEN: usize = 5;

/// Errors produced while parsing or serializing a frame. Each variant
/// carries a short context string for the log line.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame shorter than minimum: {0}")]
    TooShort(String),
    #[error("data section does not match header size: {0}")]
    SizeMismatch(String),
    #[error("unknown frame kind: {0}")]
    BadKind(String),
    #[error("unknown or unsupported data type: {0}")]
    BadDataType(String),
    #[error("malformed channel data: {0}")]
    BadData(String),
    #[error("channel count exceeds maximum: {0}")]
    TooManyChannels(String),
}

/// Frame kind identifiers. The discriminants are wire values and must not
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[repr(u8)]
pub enum FrameKind {
    None = 0,
    Sync = 1,
    SyncResp = 2,
    Ack = 3,
    Request = 4,
    Data = 5,
    Stop = 6,
    Drop = 7,
}

impl From<FrameKind> for u8 {
    fn from(kind: FrameKind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Sync),
            2 => Ok(Self::SyncResp),
            3 => Ok(Self::Ack),
            4 => Ok(Self::Request),
            5 => Ok(Self::Data),
            6 => Ok(Self::Stop),
            7 => Ok(Self::Drop),
            other => Err(FrameError::BadKind(format!("identifier {other}"))),
        }
    }
}

/// Sample type identifiers for one channel of a DATA frame. The
/// discriminants are wire values and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[repr(u8)]
pub enum DataType {
    Char = 0,
    Int8 = 1,
    Int16 = 2,
    Int32 = 3,
    UInt8 = 4,
    UInt16 = 5,
    UInt32 = 6,
    Float8 = 7,
    Float16 = 8,
    Float32 = 9,
}

impl DataType {
    /// Element width in bytes.
    pub fn width(self) -> usize {
        match self {
            Self::Char | Self::Int8 | Self::UInt8 | Self::Float8 => 1,
            Self::Int16 | Self::UInt16 | Self::Float16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
        }
    }
}

impl From<DataType> for u8 {
    fn from(dtype: DataType) -> Self {
        dtype as u8
    }
}

impl TryFrom<u8> for DataType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Char),
            1 => Ok(Self::Int8),
            2 => Ok(Self::Int16),
            3 => Ok(Self::Int32),
            4 => Ok(Self::UInt8),
            5 => Ok(Self::UInt16),
            6 => Ok(Self::UInt32),
            7 => Ok(Self::Float8),
            8 => Ok(Self::Float16),
            9 => Ok(Self::Float32),
            other => Err(FrameError::BadDataType(format!("identifier {other}"))),
        }
    }
}

/// The decoded content of one channel inside a DATA frame. Numeric samples
/// are widened to f64 on parse so downstream consumers see a single
/// uniform type; the declared wire type is not carried past the codec.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelPayload {
    Numeric(Vec<f64>),
    Text(String),
}

/// A parsed MCTP frame. `channels` and `n_of_channels` are only populated
/// for `SyncResp` and `Data` kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub data_size: u16,
    pub n_of_channels: u8,
    pub channels: BTreeMap<u8, ChannelPayload>,
}

impl Frame {
    /// Parse a received byte buffer into a frame. The EOM delimiter and any
    /// trailing bytes past the declared payload are ignored.
    pub fn parse(raw: &[u8]) -> Result<Self, FrameError> {
        if raw.len() < MIN_FRAME_SIZE {
            return Err(FrameError::TooShort(format!(
                "{} bytes, minimum {MIN_FRAME_SIZE}",
                raw.len()
            )));
        }

        let mut header = &raw[..HEADER_SIZE];
        let kind_id = header.get_u8();
        let data_size = header.get_u16_le();
        // Remaining five reserved bytes are ignored on receive.
        let kind = FrameKind::try_from(kind_id)?;

        let payload_end = HEADER_SIZE + data_size as usize;
        if raw.len() < payload_end {
            return Err(FrameError::SizeMismatch(format!(
                "header declares {data_size} payload bytes, buffer holds {}",
                raw.len() - HEADER_SIZE
            )));
        }
        let payload = &raw[HEADER_SIZE..payload_end];

        let mut frame = Frame {
            kind,
            data_size,
            n_of_channels: 0,
            channels: BTreeMap::new(),
        };
        match kind {
            FrameKind::SyncResp => {
                frame.n_of_channels = read_channel_count(payload)?;
            }
            FrameKind::Data => {
                frame.n_of_channels = read_channel_count(payload)?;
                frame.channels = parse_channels(payload)?;
            }
            _ => {}
        }
        Ok(frame)
    }

    /// Channels whose declared type was numeric.
    pub fn numeric_channels(&self) -> impl Iterator<Item = (u8, &[f64])> {
        self.channels.iter().filter_map(|(id, payload)| match payload {
            ChannelPayload::Numeric(samples) => Some((*id, samples.as_slice())),
            ChannelPayload::Text(_) => None,
        })
    }

    /// Channels whose declared type was `Char`.
    pub fn text_channels(&self) -> impl Iterator<Item = (u8, &str)> {
        self.channels.iter().filter_map(|(id, payload)| match payload {
            ChannelPayload::Text(text) => Some((*id, text.as_str())),
            ChannelPayload::Numeric(_) => None,
        })
    }
}

fn read_channel_count(payload: &[u8]) -> Result<u8, FrameError> {
    let Some(&count) = payload.first() else {
        return Err(FrameError::BadData("missing channel count".to_string()));
    };
    if count > MAX_CHANNELS {
        return Err(FrameError::TooManyChannels(format!("{count} declared")));
    }
    Ok(count)
}

/// Walk the channel descriptors of a DATA payload. Every descriptor +
/// sample block must land inside `data_size`, and the descriptors must
/// account for the whole data section; a tail too short to hold a
/// descriptor is a decode shortfall.
fn parse_channels(payload: &[u8]) -> Result<BTreeMap<u8, ChannelPayload>, FrameError> {
    let data_size = payload.len();
    let mut channels = BTreeMap::new();
    let mut buf = &payload[1..];
    let mut total_read = 1usize;

    while total_read < data_size {
        if buf.len() < DATAINFO_SIZE {
            return Err(FrameError::BadData(format!(
                "truncated channel descriptor, {} bytes left",
                buf.len()
            )));
        }
        let ch_id = buf.get_u8();
        let ch_bytes = buf.get_u16_le() as usize;
        let dtype_id = buf.get_u8();

        total_read += DATAINFO_SIZE + ch_bytes;
        if total_read > data_size {
            return Err(FrameError::SizeMismatch(format!(
                "channel {ch_id} declares {ch_bytes} bytes past end of data section"
            )));
        }

        let dtype = DataType::try_from(dtype_id)?;
        let (raw_samples, rest) = buf.split_at(ch_bytes);
        buf = rest;
        channels.insert(ch_id, decode_samples(dtype, raw_samples)?);
    }
    Ok(channels)
}

/// Decode one channel's packed samples into a payload value. Numeric types
/// widen to f64. Float8/Float16 have no pinned on-wire encoding at this
/// protocol revision; they round-trip as opaque unsigned units of their
/// width.
fn decode_samples(dtype: DataType, raw: &[u8]) -> Result<ChannelPayload, FrameError> {
    if dtype == DataType::Char {
        let text = std::str::from_utf8(raw)
            .map_err(|e| FrameError::BadData(format!("channel text is not valid utf-8: {e}")))?;
        return Ok(ChannelPayload::Text(text.to_string()));
    }

    let width = dtype.width();
    if raw.len() % width != 0 {
        return Err(FrameError::BadData(format!(
            "{} bytes is not a multiple of {dtype} element width {width}",
            raw.len()
        )));
    }

    let samples = match dtype {
        DataType::Int8 => raw.iter().map(|&b| b as i8 as f64).collect(),
        DataType::UInt8 => raw.iter().map(|&b| b as f64).collect(),
        DataType::Int16 => chunks(raw, |c: [u8; 2]| i16::from_le_bytes(c) as f64),
        DataType::UInt16 => chunks(raw, |c: [u8; 2]| u16::from_le_bytes(c) as f64),
        DataType::Int32 => chunks(raw, |c: [u8; 4]| i32::from_le_bytes(c) as f64),
        DataType::UInt32 => chunks(raw, |c: [u8; 4]| u32::from_le_bytes(c) as f64),
        DataType::Float32 => chunks(raw, |c: [u8; 4]| f32::from_le_bytes(c) as f64),
        // Encoding not pinned down; carry the raw units.
        DataType::Float8 => raw.iter().map(|&b| b as f64).collect(),
        DataType::Float16 => chunks(raw, |c: [u8; 2]| u16::from_le_bytes(c) as f64),
        DataType::Char => unreachable!("handled above"),
    };
    Ok(ChannelPayload::Numeric(samples))
}

fn chunks<const N: usize>(raw: &[u8], convert: impl Fn([u8; N]) -> f64) -> Vec<f64> {
    raw.chunks_exact(N)
        .map(|c| convert(c.try_into().expect("chunks_exact yields N bytes")))
        .collect()
}

/// Serialize a payload-less frame (`Sync`, `Ack`, `Request`, `Stop`,
/// `Drop`).
pub fn serialize_control(kind: FrameKind) -> Vec<u8> {
    assemble(kind, &[])
}

/// Serialize a `SyncResp` frame announcing `n_of_channels` channels.
pub fn serialize_sync_resp(n_of_channels: u8) -> Vec<u8> {
    assemble(FrameKind::SyncResp, &[n_of_channels])
}

/// Serialize a `Data` frame. Channel ids are assigned 0..n in input order.
/// Numeric samples are narrowed from f64 to the declared type; a `Text`
/// payload requires the `Char` type and vice versa.
///
/// The controller never sends DATA frames in a live session; this is the
/// performer half of the codec, used to exercise the parser.
pub fn serialize_data(channels: &[(DataType, ChannelPayload)]) -> Result<Vec<u8>, FrameError> {
    let count = u8::try_from(channels.len())
        .ok()
        .filter(|&n| n <= MAX_CHANNELS)
        .ok_or_else(|| FrameError::TooManyChannels(format!("{} given", channels.len())))?;

    let mut payload = BytesMut::new();
    payload.put_u8(count);
    for (ch_id, (dtype, data)) in channels.iter().enumerate() {
        let samples = encode_samples(*dtype, data)?;
        let ch_bytes = u16::try_from(samples.len()).map_err(|_| {
            FrameError::SizeMismatch(format!("channel {ch_id} payload exceeds u16 range"))
        })?;
        payload.put_u8(ch_id as u8);
        payload.put_u16_le(ch_bytes);
        payload.put_u8((*dtype).into());
        payload.put_slice(&samples);
    }
    if payload.len() > u16::MAX as usize {
        return Err(FrameError::SizeMismatch(format!(
            "data section of {} bytes exceeds u16 range",
            payload.len()
        )));
    }
    Ok(assemble(FrameKind::Data, &payload))
}

fn encode_samples(dtype: DataType, data: &ChannelPayload) -> Result<Vec<u8>, FrameError> {
    let mut out = BytesMut::new();
    match (dtype, data) {
        (DataType::Char, ChannelPayload::Text(text)) => out.put_slice(text.as_bytes()),
        (DataType::Char, ChannelPayload::Numeric(_)) => {
            return Err(FrameError::BadData(
                "numeric samples declared as char".to_string(),
            ));
        }
        (_, ChannelPayload::Text(_)) => {
            return Err(FrameError::BadData(format!("text declared as {dtype}")));
        }
        (_, ChannelPayload::Numeric(samples)) => {
            for &sample in samples {
                match dtype {
                    DataType::Int8 => out.put_i8(sample as i8),
                    DataType::UInt8 => out.put_u8(sample as u8),
                    DataType::Int16 => out.put_i16_le(sample as i16),
                    DataType::UInt16 => out.put_u16_le(sample as u16),
                    DataType::Int32 => out.put_i32_le(sample as i32),
                    DataType::UInt32 => out.put_u32_le(sample as u32),
                    DataType::Float32 => out.put_f32_le(sample as f32),
                    // Encoding not pinned down; carry the raw units.
                    DataType::Float8 => out.put_u8(sample as u8),
                    DataType::Float16 => out.put_u16_le(sample as u16),
                    DataType::Char => unreachable!("handled above"),
                }
            }
        }
    }
    Ok(out.to_vec())
}

fn assemble(kind: FrameKind, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len() + EOM.len());
    buf.put_u8(kind.into());
    buf.put_u16_le(payload.len() as u16);
    buf.put_bytes(RESERVED_FILL, RESERVED_LEN);
    buf.put_slice(payload);
    buf.put_slice(&EOM);
    buf.to_vec()
}

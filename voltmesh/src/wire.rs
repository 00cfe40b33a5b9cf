//! Wire format serialization and deserialization.
//!
//! Every frame is a fixed 15-byte big-endian header followed by an ordered
//! TLV body:
//!
//! ```text
//! msg_type: u16 | ttl: u8 | seq_num: u32 | sender_id: 6 bytes | payload_len: u16
//! ```
//!
//! `sender_id` is the **originator** and is never rewritten on forward; a
//! forwarder only decrements `ttl` and overwrites the PREVIOUS_HOP TLV in
//! place (see [`forwarded_copy`]), so the payload stays byte-identical.
//!
//! TLVs are 1-byte type, 1-byte length, then `length` value bytes. Unknown
//! types are skipped without error. Duplicate TLVs: the first occurrence
//! wins, except the list TLVs — provider entries in PA (each introduced by
//! a PROVIDER_ID TLV) and PLATOON_MEMBERS in JOIN_ACCEPT.

use crate::types::{
    NodeId, OperationalState, PlatoonId, MAX_SEQUENCE_NUMBER,
};

/// Decoding error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Unexpected end of buffer.
    UnexpectedEof,
    /// Header `payload_len` disagrees with the actual body length.
    PayloadLengthMismatch,
    /// A TLV length field runs past the end of the body.
    TlvOverrun,
    /// Unknown `msg_type` in the header.
    InvalidMessageType,
    /// A known TLV carried a value of the wrong size.
    BadValueLength,
    /// `ttl` above the configured maximum for a forwardable kind.
    TtlExceedsMax,
    /// `seq_num` above [`MAX_SEQUENCE_NUMBER`].
    SequenceOutOfRange,
    /// A forwardable kind arrived without the required PREVIOUS_HOP TLV.
    MissingPreviousHop,
    /// An enum field carried an out-of-range discriminant.
    InvalidEnumValue,
}

/// Semantic bounds applied at decode time, derived from `ProtocolConfig`.
#[derive(Clone, Copy, Debug)]
pub struct WireLimits {
    /// Maximum `ttl` accepted on forwardable kinds (PA, GRID_STATUS,
    /// PLATOON_ANNOUNCE).
    pub forwardable_ttl_max: u8,
    /// Maximum accepted sequence number.
    pub max_seq: u32,
}

impl Default for WireLimits {
    fn default() -> Self {
        Self {
            forwardable_ttl_max: 6,
            max_seq: MAX_SEQUENCE_NUMBER,
        }
    }
}

/// Message type discriminators. Stable assignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    Hello = 1,
    Pa = 2,
    JoinOffer = 3,
    JoinAccept = 4,
    Ack = 5,
    AckAck = 6,
    PlatoonBeacon = 7,
    PlatoonStatus = 8,
    GridStatus = 9,
    PlatoonAnnounce = 10,
}

impl MsgType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(MsgType::Hello),
            2 => Some(MsgType::Pa),
            3 => Some(MsgType::JoinOffer),
            4 => Some(MsgType::JoinAccept),
            5 => Some(MsgType::Ack),
            6 => Some(MsgType::AckAck),
            7 => Some(MsgType::PlatoonBeacon),
            8 => Some(MsgType::PlatoonStatus),
            9 => Some(MsgType::GridStatus),
            10 => Some(MsgType::PlatoonAnnounce),
            _ => None,
        }
    }

    /// Kinds that travel multiple hops and therefore carry PREVIOUS_HOP.
    pub fn is_forwardable(self) -> bool {
        matches!(
            self,
            MsgType::Pa | MsgType::GridStatus | MsgType::PlatoonAnnounce
        )
    }
}

/// TLV type assignments. Stable; gaps are reserved.
pub mod tlv {
    pub const NODE_ID: u8 = 1;
    pub const NEIGHBOR_LIST: u8 = 2;
    pub const METRICS: u8 = 3;
    pub const PROVIDER_FLAG: u8 = 4;
    pub const NODE_ATTRIBUTES: u8 = 5;

    pub const PROVIDER_ID: u8 = 10;
    pub const PROVIDER_TYPE: u8 = 11;
    pub const POSITION: u8 = 12;
    pub const DESTINATION: u8 = 13;
    pub const PLATOON_SIZE: u8 = 14;
    pub const ENERGY_AVAILABLE: u8 = 15;
    pub const DIRECTION: u8 = 16;

    pub const CONSUMER_ID: u8 = 20;
    pub const ENERGY_REQUIRED: u8 = 21;
    pub const TRAJECTORY: u8 = 22;
    pub const MEETING_POINT: u8 = 23;

    pub const BANDWIDTH: u8 = 30;
    pub const DURATION: u8 = 31;
    pub const PLATOON_MEMBERS: u8 = 32;
    pub const TOPOLOGY: u8 = 33;

    pub const VELOCITY: u8 = 41;
    pub const AVAILABLE_SLOTS: u8 = 42;

    pub const BATTERY_LEVEL: u8 = 50;
    pub const RELATIVE_INDEX: u8 = 51;
    pub const RECEIVE_RATE: u8 = 52;

    pub const HUB_ID: u8 = 60;
    pub const RENEWABLE_FRACTION: u8 = 61;
    pub const AVAILABLE_POWER: u8 = 62;
    pub const MAX_SESSIONS: u8 = 63;
    pub const QUEUE_TIME: u8 = 64;
    pub const OPERATIONAL_STATE: u8 = 66;

    pub const PLATOON_ID: u8 = 70;
    pub const HEAD_ID: u8 = 71;
    pub const HEAD_POSITION: u8 = 72;

    pub const PREVIOUS_HOP: u8 = 80;
    pub const FORMATION_POSITIONS: u8 = 81;
    pub const SURPLUS_ENERGY: u8 = 82;
    pub const DIRECTION_VECTOR: u8 = 83;
    pub const FORMATION_EFFICIENCY: u8 = 84;
}

/// Bit set on the per-neighbor link-status byte when the sender selected
/// that neighbor as one of its MPRs.
pub const LINK_FLAG_MPR_SELECTED: u8 = 0x80;

/// Fixed frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub msg_type: MsgType,
    pub ttl: u8,
    pub seq_num: u32,
    pub sender_id: NodeId,
    pub payload_len: u16,
}

impl Header {
    pub const SIZE: usize = 15;

    /// Byte offset of the `ttl` field, used by the in-place forward patch.
    pub const TTL_OFFSET: usize = 2;

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < Self::SIZE {
            return Err(DecodeError::UnexpectedEof);
        }
        let raw_type = u16::from_be_bytes([buf[0], buf[1]]);
        let msg_type = MsgType::from_u16(raw_type).ok_or(DecodeError::InvalidMessageType)?;
        let ttl = buf[2];
        let seq_num = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]);
        let mut sender_id = [0u8; 6];
        sender_id.copy_from_slice(&buf[7..13]);
        let payload_len = u16::from_be_bytes([buf[13], buf[14]]);
        Ok(Self {
            msg_type,
            ttl,
            seq_num,
            sender_id,
            payload_len,
        })
    }

    pub fn encode(&self, w: &mut Writer) {
        w.write_u16_be(self.msg_type as u16);
        w.write_u8(self.ttl);
        w.write_u32_be(self.seq_num);
        w.write_node_id(&self.sender_id);
        w.write_u16_be(self.payload_len);
    }
}

/// Zero-copy reader over a byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        if self.pos >= self.buf.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.pos + len > self.buf.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u16_be(&mut self) -> Result<u16, DecodeError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32_be(&mut self) -> Result<u32, DecodeError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_f32_be(&mut self) -> Result<f32, DecodeError> {
        let b = self.read_bytes(4)?;
        Ok(f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_node_id(&mut self) -> Result<NodeId, DecodeError> {
        let b = self.read_bytes(6)?;
        let mut id = [0u8; 6];
        id.copy_from_slice(b);
        Ok(id)
    }
}

/// Writer for encoding frames.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn write_u16_be(&mut self, v: u16) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_u32_be(&mut self, v: u32) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_f32_be(&mut self, v: f32) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_node_id(&mut self, id: &NodeId) {
        self.write_bytes(id);
    }

    /// Write one TLV. Values longer than 255 bytes are a programmer error.
    pub fn write_tlv(&mut self, tlv_type: u8, value: &[u8]) {
        debug_assert!(value.len() <= 255, "TLV value too long");
        self.write_u8(tlv_type);
        self.write_u8(value.len() as u8);
        self.write_bytes(value);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

// Small value-encoding helpers shared by the message kinds.

fn f32_bytes(v: f32) -> [u8; 4] {
    v.to_be_bytes()
}

fn pair_bytes(p: (f32, f32)) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&p.0.to_be_bytes());
    out[4..].copy_from_slice(&p.1.to_be_bytes());
    out
}

fn parse_f32(v: &[u8]) -> Result<f32, DecodeError> {
    if v.len() != 4 {
        return Err(DecodeError::BadValueLength);
    }
    Ok(f32::from_be_bytes([v[0], v[1], v[2], v[3]]))
}

fn parse_pair(v: &[u8]) -> Result<(f32, f32), DecodeError> {
    if v.len() != 8 {
        return Err(DecodeError::BadValueLength);
    }
    Ok((
        f32::from_be_bytes([v[0], v[1], v[2], v[3]]),
        f32::from_be_bytes([v[4], v[5], v[6], v[7]]),
    ))
}

fn parse_u8(v: &[u8]) -> Result<u8, DecodeError> {
    if v.len() != 1 {
        return Err(DecodeError::BadValueLength);
    }
    Ok(v[0])
}

fn parse_node_id(v: &[u8]) -> Result<NodeId, DecodeError> {
    if v.len() != 6 {
        return Err(DecodeError::BadValueLength);
    }
    let mut id = [0u8; 6];
    id.copy_from_slice(v);
    Ok(id)
}

/// Iterator over the TLVs of a frame body. Yields `(type, value)`.
struct TlvIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> TlvIter<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = Result<(u8, &'a [u8]), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        if self.pos + 2 > self.buf.len() {
            return Some(Err(DecodeError::TlvOverrun));
        }
        let t = self.buf[self.pos];
        let len = self.buf[self.pos + 1] as usize;
        let start = self.pos + 2;
        if start + len > self.buf.len() {
            return Some(Err(DecodeError::TlvOverrun));
        }
        self.pos = start + len;
        Some(Ok((t, &self.buf[start..start + len])))
    }
}

/// Trait for payloads that can be written to the wire.
pub trait Encode {
    /// Append this payload's TLV body to the writer, in canonical order.
    fn encode(&self, w: &mut Writer);

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.finish()
    }
}

/// One advertised neighbor inside a HELLO.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HelloNeighbor {
    pub id: NodeId,
    pub link: crate::types::LinkStatus,
    /// True when the sender selected this neighbor as one of its MPRs.
    pub mpr_selected: bool,
}

/// Physical state advertised in HELLO.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodeAttributes {
    pub battery_capacity_kwh: f32,
    pub battery_energy_kwh: f32,
    pub min_energy_kwh: f32,
    pub max_transfer_rate_in: f32,
    pub max_transfer_rate_out: f32,
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub battery_health: f32,
}

/// QoS metrics advertised in HELLO.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinkMetrics {
    pub etx: f32,
    pub jitter_ms: f32,
    pub willingness: u8,
    pub lane_weight: f32,
    pub link_stability: f32,
}

impl Default for LinkMetrics {
    fn default() -> Self {
        Self {
            etx: 1.0,
            jitter_ms: 0.0,
            willingness: 3,
            lane_weight: 0.5,
            link_stability: 1.0,
        }
    }
}

/// Layer A neighbor discovery beacon.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Hello {
    pub neighbors: Vec<HelloNeighbor>,
    pub attrs: NodeAttributes,
    pub metrics: LinkMetrics,
    pub provider: bool,
    /// Shareable energy, present only when `provider` is set.
    pub energy_available_kwh: Option<f32>,
    /// Heading unit vector, present only when `provider` is set.
    pub direction: Option<(f32, f32)>,
}

impl Default for NodeAttributes {
    fn default() -> Self {
        Self {
            battery_capacity_kwh: 100.0,
            battery_energy_kwh: 50.0,
            min_energy_kwh: 10.0,
            max_transfer_rate_in: 50.0,
            max_transfer_rate_out: 50.0,
            x: 0.0,
            y: 0.0,
            vx: 0.0,
            vy: 0.0,
            battery_health: 1.0,
        }
    }
}

impl Encode for Hello {
    fn encode(&self, w: &mut Writer) {
        if !self.neighbors.is_empty() {
            let mut value = Vec::with_capacity(self.neighbors.len() * 7);
            for n in &self.neighbors {
                value.extend_from_slice(&n.id);
                let mut status = n.link.as_u8();
                if n.mpr_selected {
                    status |= LINK_FLAG_MPR_SELECTED;
                }
                value.push(status);
            }
            w.write_tlv(tlv::NEIGHBOR_LIST, &value);
        }
        let a = &self.attrs;
        let mut attrs = Vec::with_capacity(40);
        for v in [
            a.battery_capacity_kwh,
            a.battery_energy_kwh,
            a.min_energy_kwh,
            a.max_transfer_rate_in,
            a.max_transfer_rate_out,
            a.x,
            a.y,
            a.vx,
            a.vy,
            a.battery_health,
        ] {
            attrs.extend_from_slice(&f32_bytes(v));
        }
        w.write_tlv(tlv::NODE_ATTRIBUTES, &attrs);

        let m = &self.metrics;
        let mut metrics = Vec::with_capacity(17);
        metrics.extend_from_slice(&f32_bytes(m.etx));
        metrics.extend_from_slice(&f32_bytes(m.jitter_ms));
        metrics.push(m.willingness);
        metrics.extend_from_slice(&f32_bytes(m.lane_weight));
        metrics.extend_from_slice(&f32_bytes(m.link_stability));
        w.write_tlv(tlv::METRICS, &metrics);

        if self.provider {
            w.write_tlv(tlv::PROVIDER_FLAG, &[1]);
            if let Some(energy) = self.energy_available_kwh {
                w.write_tlv(tlv::ENERGY_AVAILABLE, &f32_bytes(energy));
            }
            if let Some(dir) = self.direction {
                w.write_tlv(tlv::DIRECTION, &pair_bytes(dir));
            }
        }
    }
}

impl Hello {
    fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let mut msg = Hello::default();
        let mut seen_neighbors = false;
        let mut seen_attrs = false;
        let mut seen_metrics = false;
        let mut seen_flag = false;
        for item in TlvIter::new(body) {
            let (t, v) = item?;
            match t {
                tlv::NEIGHBOR_LIST if !seen_neighbors => {
                    seen_neighbors = true;
                    if v.len() % 7 != 0 {
                        return Err(DecodeError::BadValueLength);
                    }
                    for chunk in v.chunks_exact(7) {
                        let id = parse_node_id(&chunk[..6])?;
                        let status = chunk[6];
                        let link = crate::types::LinkStatus::from_u8(
                            status & !LINK_FLAG_MPR_SELECTED,
                        )
                        .ok_or(DecodeError::InvalidEnumValue)?;
                        msg.neighbors.push(HelloNeighbor {
                            id,
                            link,
                            mpr_selected: status & LINK_FLAG_MPR_SELECTED != 0,
                        });
                    }
                }
                tlv::NODE_ATTRIBUTES if !seen_attrs => {
                    seen_attrs = true;
                    if v.len() != 40 {
                        return Err(DecodeError::BadValueLength);
                    }
                    let mut r = Reader::new(v);
                    msg.attrs = NodeAttributes {
                        battery_capacity_kwh: r.read_f32_be()?,
                        battery_energy_kwh: r.read_f32_be()?,
                        min_energy_kwh: r.read_f32_be()?,
                        max_transfer_rate_in: r.read_f32_be()?,
                        max_transfer_rate_out: r.read_f32_be()?,
                        x: r.read_f32_be()?,
                        y: r.read_f32_be()?,
                        vx: r.read_f32_be()?,
                        vy: r.read_f32_be()?,
                        battery_health: r.read_f32_be()?,
                    };
                }
                tlv::METRICS if !seen_metrics => {
                    seen_metrics = true;
                    if v.len() != 17 {
                        return Err(DecodeError::BadValueLength);
                    }
                    let mut r = Reader::new(v);
                    msg.metrics = LinkMetrics {
                        etx: r.read_f32_be()?,
                        jitter_ms: r.read_f32_be()?,
                        willingness: r.read_u8()?,
                        lane_weight: r.read_f32_be()?,
                        link_stability: r.read_f32_be()?,
                    };
                }
                tlv::PROVIDER_FLAG if !seen_flag => {
                    seen_flag = true;
                    msg.provider = parse_u8(v)? != 0;
                }
                tlv::ENERGY_AVAILABLE if msg.energy_available_kwh.is_none() => {
                    msg.energy_available_kwh = Some(parse_f32(v)?);
                }
                tlv::DIRECTION if msg.direction.is_none() => {
                    msg.direction = Some(parse_pair(v)?);
                }
                _ => {} // unknown or duplicate: skip
            }
        }
        Ok(msg)
    }
}

/// One provider advertised in a PA. Entries repeat; each begins with its
/// PROVIDER_ID TLV.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PaEntry {
    pub provider_id: NodeId,
    pub provider_type: crate::types::ProviderType,
    pub position: (f32, f32),
    pub destination: (f32, f32),
    pub direction: (f32, f32),
    pub platoon_size: u8,
    pub available_slots: u8,
    pub energy_available_kwh: f32,
    pub renewable_fraction: f32,
}

impl PaEntry {
    fn encode(&self, w: &mut Writer) {
        w.write_tlv(tlv::PROVIDER_ID, &self.provider_id);
        w.write_tlv(tlv::PROVIDER_TYPE, &[self.provider_type.as_u8()]);
        w.write_tlv(tlv::POSITION, &pair_bytes(self.position));
        w.write_tlv(tlv::DESTINATION, &pair_bytes(self.destination));
        w.write_tlv(tlv::DIRECTION, &pair_bytes(self.direction));
        w.write_tlv(tlv::PLATOON_SIZE, &[self.platoon_size]);
        w.write_tlv(tlv::AVAILABLE_SLOTS, &[self.available_slots]);
        w.write_tlv(tlv::ENERGY_AVAILABLE, &f32_bytes(self.energy_available_kwh));
        w.write_tlv(tlv::RENEWABLE_FRACTION, &f32_bytes(self.renewable_fraction));
    }

    fn empty(provider_id: NodeId) -> Self {
        Self {
            provider_id,
            provider_type: crate::types::ProviderType::MobileProvider,
            position: (0.0, 0.0),
            destination: (0.0, 0.0),
            direction: (0.0, 0.0),
            platoon_size: 0,
            available_slots: 0,
            energy_available_kwh: 0.0,
            renewable_fraction: 0.0,
        }
    }
}

/// Layer B provider announcement, TTL-bounded and MPR-forwarded.
#[derive(Clone, Debug, PartialEq)]
pub struct Pa {
    pub entries: Vec<PaEntry>,
    pub previous_hop: NodeId,
}

impl Encode for Pa {
    fn encode(&self, w: &mut Writer) {
        for entry in &self.entries {
            entry.encode(w);
        }
        w.write_tlv(tlv::PREVIOUS_HOP, &self.previous_hop);
    }
}

impl Pa {
    fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let mut entries: Vec<PaEntry> = Vec::new();
        // First-occurrence-wins guards for the current entry's fields;
        // only the PROVIDER_ID delimiter itself repeats.
        let mut seen = [false; 8];
        let mut previous_hop: Option<NodeId> = None;
        for item in TlvIter::new(body) {
            let (t, v) = item?;
            match t {
                tlv::PROVIDER_ID => {
                    entries.push(PaEntry::empty(parse_node_id(v)?));
                    seen = [false; 8];
                }
                tlv::PREVIOUS_HOP if previous_hop.is_none() => {
                    previous_hop = Some(parse_node_id(v)?);
                }
                _ => {
                    let Some(entry) = entries.last_mut() else {
                        continue; // field TLV before any PROVIDER_ID: skip
                    };
                    match t {
                        tlv::PROVIDER_TYPE if !seen[0] => {
                            seen[0] = true;
                            entry.provider_type =
                                crate::types::ProviderType::from_u8(parse_u8(v)?)
                                    .ok_or(DecodeError::InvalidEnumValue)?;
                        }
                        tlv::POSITION if !seen[1] => {
                            seen[1] = true;
                            entry.position = parse_pair(v)?;
                        }
                        tlv::DESTINATION if !seen[2] => {
                            seen[2] = true;
                            entry.destination = parse_pair(v)?;
                        }
                        tlv::DIRECTION if !seen[3] => {
                            seen[3] = true;
                            entry.direction = parse_pair(v)?;
                        }
                        tlv::PLATOON_SIZE if !seen[4] => {
                            seen[4] = true;
                            entry.platoon_size = parse_u8(v)?;
                        }
                        tlv::AVAILABLE_SLOTS if !seen[5] => {
                            seen[5] = true;
                            entry.available_slots = parse_u8(v)?;
                        }
                        tlv::ENERGY_AVAILABLE if !seen[6] => {
                            seen[6] = true;
                            entry.energy_available_kwh = parse_f32(v)?;
                        }
                        tlv::RENEWABLE_FRACTION if !seen[7] => {
                            seen[7] = true;
                            entry.renewable_fraction = parse_f32(v)?;
                        }
                        _ => {}
                    }
                }
            }
        }
        let previous_hop = previous_hop.ok_or(DecodeError::MissingPreviousHop)?;
        Ok(Self {
            entries,
            previous_hop,
        })
    }
}

/// Consumer's request to book a charging session.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JoinOffer {
    pub consumer_id: NodeId,
    /// Logical addressee; other providers ignore the offer.
    pub provider_id: NodeId,
    pub energy_required_kwh: f32,
    pub position: (f32, f32),
    /// Consumer's destination, for route-alignment scoring.
    pub trajectory: (f32, f32),
    pub meeting_point: (f32, f32),
}

impl Encode for JoinOffer {
    fn encode(&self, w: &mut Writer) {
        w.write_tlv(tlv::CONSUMER_ID, &self.consumer_id);
        w.write_tlv(tlv::PROVIDER_ID, &self.provider_id);
        w.write_tlv(tlv::ENERGY_REQUIRED, &f32_bytes(self.energy_required_kwh));
        w.write_tlv(tlv::POSITION, &pair_bytes(self.position));
        w.write_tlv(tlv::TRAJECTORY, &pair_bytes(self.trajectory));
        w.write_tlv(tlv::MEETING_POINT, &pair_bytes(self.meeting_point));
    }
}

impl JoinOffer {
    fn decode(body: &[u8], sender: &NodeId) -> Result<Self, DecodeError> {
        let mut msg = JoinOffer {
            consumer_id: *sender,
            provider_id: [0; 6],
            energy_required_kwh: 0.0,
            position: (0.0, 0.0),
            trajectory: (0.0, 0.0),
            meeting_point: (0.0, 0.0),
        };
        let mut seen = [false; 6];
        for item in TlvIter::new(body) {
            let (t, v) = item?;
            match t {
                tlv::CONSUMER_ID if !seen[0] => {
                    seen[0] = true;
                    msg.consumer_id = parse_node_id(v)?;
                }
                tlv::PROVIDER_ID if !seen[1] => {
                    seen[1] = true;
                    msg.provider_id = parse_node_id(v)?;
                }
                tlv::ENERGY_REQUIRED if !seen[2] => {
                    seen[2] = true;
                    msg.energy_required_kwh = parse_f32(v)?;
                }
                tlv::POSITION if !seen[3] => {
                    seen[3] = true;
                    msg.position = parse_pair(v)?;
                }
                tlv::TRAJECTORY if !seen[4] => {
                    seen[4] = true;
                    msg.trajectory = parse_pair(v)?;
                }
                tlv::MEETING_POINT if !seen[5] => {
                    seen[5] = true;
                    msg.meeting_point = parse_pair(v)?;
                }
                _ => {}
            }
        }
        Ok(msg)
    }
}

/// Provider's acceptance of a JOIN_OFFER.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinAccept {
    pub provider_id: NodeId,
    pub consumer_id: NodeId,
    pub meeting_point: (f32, f32),
    /// Expected charging bandwidth in kW.
    pub bandwidth_kw: f32,
    /// Expected session duration in seconds.
    pub duration_s: f32,
    /// Set when the provider is a platoon head.
    pub platoon_id: Option<PlatoonId>,
    /// Current platoon roster; repeats as a list TLV.
    pub members: Vec<NodeId>,
}

impl Encode for JoinAccept {
    fn encode(&self, w: &mut Writer) {
        w.write_tlv(tlv::PROVIDER_ID, &self.provider_id);
        w.write_tlv(tlv::CONSUMER_ID, &self.consumer_id);
        w.write_tlv(tlv::MEETING_POINT, &pair_bytes(self.meeting_point));
        w.write_tlv(tlv::BANDWIDTH, &f32_bytes(self.bandwidth_kw));
        w.write_tlv(tlv::DURATION, &f32_bytes(self.duration_s));
        if let Some(pid) = &self.platoon_id {
            w.write_tlv(tlv::PLATOON_ID, pid);
        }
        for member in &self.members {
            w.write_tlv(tlv::PLATOON_MEMBERS, member);
        }
    }
}

impl JoinAccept {
    fn decode(body: &[u8], sender: &NodeId) -> Result<Self, DecodeError> {
        let mut msg = JoinAccept {
            provider_id: *sender,
            consumer_id: [0; 6],
            meeting_point: (0.0, 0.0),
            bandwidth_kw: 0.0,
            duration_s: 0.0,
            platoon_id: None,
            members: Vec::new(),
        };
        let mut seen = [false; 5];
        for item in TlvIter::new(body) {
            let (t, v) = item?;
            match t {
                tlv::PROVIDER_ID if !seen[0] => {
                    seen[0] = true;
                    msg.provider_id = parse_node_id(v)?;
                }
                tlv::CONSUMER_ID if !seen[1] => {
                    seen[1] = true;
                    msg.consumer_id = parse_node_id(v)?;
                }
                tlv::MEETING_POINT if !seen[2] => {
                    seen[2] = true;
                    msg.meeting_point = parse_pair(v)?;
                }
                tlv::BANDWIDTH if !seen[3] => {
                    seen[3] = true;
                    msg.bandwidth_kw = parse_f32(v)?;
                }
                tlv::DURATION if !seen[4] => {
                    seen[4] = true;
                    msg.duration_s = parse_f32(v)?;
                }
                tlv::PLATOON_ID if msg.platoon_id.is_none() => {
                    msg.platoon_id = Some(parse_node_id(v)?);
                }
                tlv::PLATOON_MEMBERS => {
                    msg.members.push(parse_node_id(v)?);
                }
                _ => {}
            }
        }
        Ok(msg)
    }
}

/// Consumer's confirmation of a JOIN_ACCEPT.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ack {
    pub consumer_id: NodeId,
    pub provider_id: NodeId,
}

impl Encode for Ack {
    fn encode(&self, w: &mut Writer) {
        w.write_tlv(tlv::CONSUMER_ID, &self.consumer_id);
        w.write_tlv(tlv::PROVIDER_ID, &self.provider_id);
    }
}

impl Ack {
    fn decode(body: &[u8], sender: &NodeId) -> Result<Self, DecodeError> {
        let mut msg = Ack {
            consumer_id: *sender,
            provider_id: [0; 6],
        };
        let mut seen = [false; 2];
        for item in TlvIter::new(body) {
            let (t, v) = item?;
            match t {
                tlv::CONSUMER_ID if !seen[0] => {
                    seen[0] = true;
                    msg.consumer_id = parse_node_id(v)?;
                }
                tlv::PROVIDER_ID if !seen[1] => {
                    seen[1] = true;
                    msg.provider_id = parse_node_id(v)?;
                }
                _ => {}
            }
        }
        Ok(msg)
    }
}

/// Provider's final booking confirmation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AckAck {
    pub provider_id: NodeId,
    pub consumer_id: NodeId,
}

impl Encode for AckAck {
    fn encode(&self, w: &mut Writer) {
        w.write_tlv(tlv::PROVIDER_ID, &self.provider_id);
        w.write_tlv(tlv::CONSUMER_ID, &self.consumer_id);
    }
}

impl AckAck {
    fn decode(body: &[u8], sender: &NodeId) -> Result<Self, DecodeError> {
        let mut msg = AckAck {
            provider_id: *sender,
            consumer_id: [0; 6],
        };
        let mut seen = [false; 2];
        for item in TlvIter::new(body) {
            let (t, v) = item?;
            match t {
                tlv::PROVIDER_ID if !seen[0] => {
                    seen[0] = true;
                    msg.provider_id = parse_node_id(v)?;
                }
                tlv::CONSUMER_ID if !seen[1] => {
                    seen[1] = true;
                    msg.consumer_id = parse_node_id(v)?;
                }
                _ => {}
            }
        }
        Ok(msg)
    }
}

/// Intra-platoon beacon from the head. A beacon whose `head_id` differs
/// from the platoon's previous head announces a handoff.
#[derive(Clone, Debug, PartialEq)]
pub struct PlatoonBeacon {
    pub platoon_id: PlatoonId,
    pub head_id: NodeId,
    pub position: (f32, f32),
    pub velocity: (f32, f32),
    pub available_slots: u8,
    /// Ordered roster: (member id, relative index).
    pub topology: Vec<(NodeId, u8)>,
    /// Advisory formation targets: (member id, x, y) relative metres.
    pub formation: Vec<(NodeId, f32, f32)>,
}

impl Encode for PlatoonBeacon {
    fn encode(&self, w: &mut Writer) {
        w.write_tlv(tlv::PLATOON_ID, &self.platoon_id);
        w.write_tlv(tlv::HEAD_ID, &self.head_id);
        w.write_tlv(tlv::HEAD_POSITION, &pair_bytes(self.position));
        w.write_tlv(tlv::VELOCITY, &pair_bytes(self.velocity));
        w.write_tlv(tlv::AVAILABLE_SLOTS, &[self.available_slots]);
        if !self.topology.is_empty() {
            let mut value = Vec::with_capacity(self.topology.len() * 7);
            for (id, idx) in &self.topology {
                value.extend_from_slice(id);
                value.push(*idx);
            }
            w.write_tlv(tlv::TOPOLOGY, &value);
        }
        if !self.formation.is_empty() {
            let mut value = Vec::with_capacity(self.formation.len() * 14);
            for (id, x, y) in &self.formation {
                value.extend_from_slice(id);
                value.extend_from_slice(&f32_bytes(*x));
                value.extend_from_slice(&f32_bytes(*y));
            }
            w.write_tlv(tlv::FORMATION_POSITIONS, &value);
        }
    }
}

impl PlatoonBeacon {
    fn decode(body: &[u8], sender: &NodeId) -> Result<Self, DecodeError> {
        let mut msg = PlatoonBeacon {
            platoon_id: [0; 6],
            head_id: *sender,
            position: (0.0, 0.0),
            velocity: (0.0, 0.0),
            available_slots: 0,
            topology: Vec::new(),
            formation: Vec::new(),
        };
        let mut seen = [false; 7];
        for item in TlvIter::new(body) {
            let (t, v) = item?;
            match t {
                tlv::PLATOON_ID if !seen[0] => {
                    seen[0] = true;
                    msg.platoon_id = parse_node_id(v)?;
                }
                tlv::HEAD_ID if !seen[1] => {
                    seen[1] = true;
                    msg.head_id = parse_node_id(v)?;
                }
                tlv::HEAD_POSITION if !seen[2] => {
                    seen[2] = true;
                    msg.position = parse_pair(v)?;
                }
                tlv::VELOCITY if !seen[3] => {
                    seen[3] = true;
                    msg.velocity = parse_pair(v)?;
                }
                tlv::AVAILABLE_SLOTS if !seen[4] => {
                    seen[4] = true;
                    msg.available_slots = parse_u8(v)?;
                }
                tlv::TOPOLOGY if !seen[5] => {
                    seen[5] = true;
                    if v.len() % 7 != 0 {
                        return Err(DecodeError::BadValueLength);
                    }
                    for chunk in v.chunks_exact(7) {
                        msg.topology.push((parse_node_id(&chunk[..6])?, chunk[6]));
                    }
                }
                tlv::FORMATION_POSITIONS if !seen[6] => {
                    seen[6] = true;
                    if v.len() % 14 != 0 {
                        return Err(DecodeError::BadValueLength);
                    }
                    for chunk in v.chunks_exact(14) {
                        let id = parse_node_id(&chunk[..6])?;
                        let x = parse_f32(&chunk[6..10])?;
                        let y = parse_f32(&chunk[10..14])?;
                        msg.formation.push((id, x, y));
                    }
                }
                _ => {}
            }
        }
        Ok(msg)
    }
}

/// Member → head status report.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlatoonStatus {
    pub platoon_id: PlatoonId,
    pub member_id: NodeId,
    pub battery_pct: f32,
    pub relative_index: u8,
    pub receive_rate: f32,
}

impl Encode for PlatoonStatus {
    fn encode(&self, w: &mut Writer) {
        w.write_tlv(tlv::PLATOON_ID, &self.platoon_id);
        w.write_tlv(tlv::NODE_ID, &self.member_id);
        w.write_tlv(tlv::BATTERY_LEVEL, &f32_bytes(self.battery_pct));
        w.write_tlv(tlv::RELATIVE_INDEX, &[self.relative_index]);
        w.write_tlv(tlv::RECEIVE_RATE, &f32_bytes(self.receive_rate));
    }
}

impl PlatoonStatus {
    fn decode(body: &[u8], sender: &NodeId) -> Result<Self, DecodeError> {
        let mut msg = PlatoonStatus {
            platoon_id: [0; 6],
            member_id: *sender,
            battery_pct: 0.0,
            relative_index: 0,
            receive_rate: 0.0,
        };
        let mut seen = [false; 5];
        for item in TlvIter::new(body) {
            let (t, v) = item?;
            match t {
                tlv::PLATOON_ID if !seen[0] => {
                    seen[0] = true;
                    msg.platoon_id = parse_node_id(v)?;
                }
                tlv::NODE_ID if !seen[1] => {
                    seen[1] = true;
                    msg.member_id = parse_node_id(v)?;
                }
                tlv::BATTERY_LEVEL if !seen[2] => {
                    seen[2] = true;
                    msg.battery_pct = parse_f32(v)?;
                }
                tlv::RELATIVE_INDEX if !seen[3] => {
                    seen[3] = true;
                    msg.relative_index = parse_u8(v)?;
                }
                tlv::RECEIVE_RATE if !seen[4] => {
                    seen[4] = true;
                    msg.receive_rate = parse_f32(v)?;
                }
                _ => {}
            }
        }
        Ok(msg)
    }
}

/// RREH grid status, multi-hop forwardable.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridStatus {
    pub hub_id: NodeId,
    pub renewable_fraction: f32,
    pub available_power_kw: f32,
    pub max_sessions: u8,
    pub queue_time_s: f32,
    pub operational_state: OperationalState,
    pub previous_hop: NodeId,
}

impl Encode for GridStatus {
    fn encode(&self, w: &mut Writer) {
        w.write_tlv(tlv::HUB_ID, &self.hub_id);
        w.write_tlv(tlv::RENEWABLE_FRACTION, &f32_bytes(self.renewable_fraction));
        w.write_tlv(tlv::AVAILABLE_POWER, &f32_bytes(self.available_power_kw));
        w.write_tlv(tlv::MAX_SESSIONS, &[self.max_sessions]);
        w.write_tlv(tlv::QUEUE_TIME, &f32_bytes(self.queue_time_s));
        w.write_tlv(tlv::OPERATIONAL_STATE, &[self.operational_state.as_u8()]);
        w.write_tlv(tlv::PREVIOUS_HOP, &self.previous_hop);
    }
}

impl GridStatus {
    fn decode(body: &[u8], sender: &NodeId) -> Result<Self, DecodeError> {
        let mut msg = GridStatus {
            hub_id: *sender,
            renewable_fraction: 1.0,
            available_power_kw: 0.0,
            max_sessions: 1,
            queue_time_s: 0.0,
            operational_state: OperationalState::Normal,
            previous_hop: [0; 6],
        };
        let mut seen = [false; 6];
        let mut have_prev = false;
        for item in TlvIter::new(body) {
            let (t, v) = item?;
            match t {
                tlv::HUB_ID if !seen[0] => {
                    seen[0] = true;
                    msg.hub_id = parse_node_id(v)?;
                }
                tlv::RENEWABLE_FRACTION if !seen[1] => {
                    seen[1] = true;
                    msg.renewable_fraction = parse_f32(v)?;
                }
                tlv::AVAILABLE_POWER if !seen[2] => {
                    seen[2] = true;
                    msg.available_power_kw = parse_f32(v)?;
                }
                tlv::MAX_SESSIONS if !seen[3] => {
                    seen[3] = true;
                    msg.max_sessions = parse_u8(v)?;
                }
                tlv::QUEUE_TIME if !seen[4] => {
                    seen[4] = true;
                    msg.queue_time_s = parse_f32(v)?;
                }
                tlv::OPERATIONAL_STATE if !seen[5] => {
                    seen[5] = true;
                    msg.operational_state = OperationalState::from_u8(parse_u8(v)?)
                        .ok_or(DecodeError::InvalidEnumValue)?;
                }
                tlv::PREVIOUS_HOP if !have_prev => {
                    have_prev = true;
                    msg.previous_hop = parse_node_id(v)?;
                }
                _ => {}
            }
        }
        if !have_prev {
            return Err(DecodeError::MissingPreviousHop);
        }
        Ok(msg)
    }
}

/// Inter-platoon discovery announcement, multi-hop forwardable.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlatoonAnnounce {
    pub platoon_id: PlatoonId,
    pub head_id: NodeId,
    pub position: (f32, f32),
    pub destination: (f32, f32),
    pub available_slots: u8,
    pub surplus_energy_kwh: f32,
    pub direction: (f32, f32),
    pub formation_efficiency: f32,
    pub previous_hop: NodeId,
}

impl Encode for PlatoonAnnounce {
    fn encode(&self, w: &mut Writer) {
        w.write_tlv(tlv::PLATOON_ID, &self.platoon_id);
        w.write_tlv(tlv::HEAD_ID, &self.head_id);
        w.write_tlv(tlv::POSITION, &pair_bytes(self.position));
        w.write_tlv(tlv::DESTINATION, &pair_bytes(self.destination));
        w.write_tlv(tlv::AVAILABLE_SLOTS, &[self.available_slots]);
        w.write_tlv(tlv::SURPLUS_ENERGY, &f32_bytes(self.surplus_energy_kwh));
        w.write_tlv(tlv::DIRECTION_VECTOR, &pair_bytes(self.direction));
        w.write_tlv(
            tlv::FORMATION_EFFICIENCY,
            &f32_bytes(self.formation_efficiency),
        );
        w.write_tlv(tlv::PREVIOUS_HOP, &self.previous_hop);
    }
}

impl PlatoonAnnounce {
    fn decode(body: &[u8], sender: &NodeId) -> Result<Self, DecodeError> {
        let mut msg = PlatoonAnnounce {
            platoon_id: [0; 6],
            head_id: *sender,
            position: (0.0, 0.0),
            destination: (0.0, 0.0),
            available_slots: 0,
            surplus_energy_kwh: 0.0,
            direction: (0.0, 0.0),
            formation_efficiency: 0.0,
            previous_hop: [0; 6],
        };
        let mut seen = [false; 8];
        let mut have_prev = false;
        for item in TlvIter::new(body) {
            let (t, v) = item?;
            match t {
                tlv::PLATOON_ID if !seen[0] => {
                    seen[0] = true;
                    msg.platoon_id = parse_node_id(v)?;
                }
                tlv::HEAD_ID if !seen[1] => {
                    seen[1] = true;
                    msg.head_id = parse_node_id(v)?;
                }
                tlv::POSITION if !seen[2] => {
                    seen[2] = true;
                    msg.position = parse_pair(v)?;
                }
                tlv::DESTINATION if !seen[3] => {
                    seen[3] = true;
                    msg.destination = parse_pair(v)?;
                }
                tlv::AVAILABLE_SLOTS if !seen[4] => {
                    seen[4] = true;
                    msg.available_slots = parse_u8(v)?;
                }
                tlv::SURPLUS_ENERGY if !seen[5] => {
                    seen[5] = true;
                    msg.surplus_energy_kwh = parse_f32(v)?;
                }
                tlv::DIRECTION_VECTOR if !seen[6] => {
                    seen[6] = true;
                    msg.direction = parse_pair(v)?;
                }
                tlv::FORMATION_EFFICIENCY if !seen[7] => {
                    seen[7] = true;
                    msg.formation_efficiency = parse_f32(v)?;
                }
                tlv::PREVIOUS_HOP if !have_prev => {
                    have_prev = true;
                    msg.previous_hop = parse_node_id(v)?;
                }
                _ => {}
            }
        }
        if !have_prev {
            return Err(DecodeError::MissingPreviousHop);
        }
        Ok(msg)
    }
}

/// Closed set of message bodies.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Hello(Hello),
    Pa(Pa),
    JoinOffer(JoinOffer),
    JoinAccept(JoinAccept),
    Ack(Ack),
    AckAck(AckAck),
    PlatoonBeacon(PlatoonBeacon),
    PlatoonStatus(PlatoonStatus),
    GridStatus(GridStatus),
    PlatoonAnnounce(PlatoonAnnounce),
}

impl Message {
    pub fn kind(&self) -> MsgType {
        match self {
            Message::Hello(_) => MsgType::Hello,
            Message::Pa(_) => MsgType::Pa,
            Message::JoinOffer(_) => MsgType::JoinOffer,
            Message::JoinAccept(_) => MsgType::JoinAccept,
            Message::Ack(_) => MsgType::Ack,
            Message::AckAck(_) => MsgType::AckAck,
            Message::PlatoonBeacon(_) => MsgType::PlatoonBeacon,
            Message::PlatoonStatus(_) => MsgType::PlatoonStatus,
            Message::GridStatus(_) => MsgType::GridStatus,
            Message::PlatoonAnnounce(_) => MsgType::PlatoonAnnounce,
        }
    }
}

impl Encode for Message {
    fn encode(&self, w: &mut Writer) {
        match self {
            Message::Hello(m) => m.encode(w),
            Message::Pa(m) => m.encode(w),
            Message::JoinOffer(m) => m.encode(w),
            Message::JoinAccept(m) => m.encode(w),
            Message::Ack(m) => m.encode(w),
            Message::AckAck(m) => m.encode(w),
            Message::PlatoonBeacon(m) => m.encode(w),
            Message::PlatoonStatus(m) => m.encode(w),
            Message::GridStatus(m) => m.encode(w),
            Message::PlatoonAnnounce(m) => m.encode(w),
        }
    }
}

/// A decoded frame: header plus typed body.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub header: Header,
    pub body: Message,
}

impl Frame {
    /// Build a frame; `payload_len` is filled in at encode time.
    pub fn new(ttl: u8, seq_num: u32, sender_id: NodeId, body: Message) -> Self {
        Self {
            header: Header {
                msg_type: body.kind(),
                ttl,
                seq_num,
                sender_id,
                payload_len: 0,
            },
            body,
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let payload = self.body.encode_to_vec();
        let mut w = Writer::new();
        let header = Header {
            msg_type: self.body.kind(),
            payload_len: payload.len() as u16,
            ..self.header
        };
        header.encode(&mut w);
        w.write_bytes(&payload);
        w.finish()
    }

    /// Decode and validate a frame against semantic bounds.
    pub fn decode(buf: &[u8], limits: &WireLimits) -> Result<Self, DecodeError> {
        let header = Header::decode(buf)?;
        let body_end = Header::SIZE + header.payload_len as usize;
        if buf.len() < body_end {
            return Err(DecodeError::PayloadLengthMismatch);
        }
        if header.seq_num > limits.max_seq {
            return Err(DecodeError::SequenceOutOfRange);
        }
        if header.msg_type.is_forwardable() && header.ttl > limits.forwardable_ttl_max {
            return Err(DecodeError::TtlExceedsMax);
        }
        let body = &buf[Header::SIZE..body_end];
        let sender = &header.sender_id;
        let message = match header.msg_type {
            MsgType::Hello => Message::Hello(Hello::decode(body)?),
            MsgType::Pa => Message::Pa(Pa::decode(body)?),
            MsgType::JoinOffer => Message::JoinOffer(JoinOffer::decode(body, sender)?),
            MsgType::JoinAccept => Message::JoinAccept(JoinAccept::decode(body, sender)?),
            MsgType::Ack => Message::Ack(Ack::decode(body, sender)?),
            MsgType::AckAck => Message::AckAck(AckAck::decode(body, sender)?),
            MsgType::PlatoonBeacon => {
                Message::PlatoonBeacon(PlatoonBeacon::decode(body, sender)?)
            }
            MsgType::PlatoonStatus => {
                Message::PlatoonStatus(PlatoonStatus::decode(body, sender)?)
            }
            MsgType::GridStatus => Message::GridStatus(GridStatus::decode(body, sender)?),
            MsgType::PlatoonAnnounce => {
                Message::PlatoonAnnounce(PlatoonAnnounce::decode(body, sender)?)
            }
        };
        Ok(Frame {
            header,
            body: message,
        })
    }
}

/// Produce the forwarded copy of a raw forwardable frame: ttl decremented,
/// PREVIOUS_HOP overwritten with `self_id`, every other byte untouched.
///
/// Returns `None` when the frame must not be forwarded: ttl would reach 0,
/// the header is short, or no PREVIOUS_HOP TLV is present.
pub fn forwarded_copy(raw: &[u8], self_id: &NodeId) -> Option<Vec<u8>> {
    if raw.len() < Header::SIZE {
        return None;
    }
    let ttl = raw[Header::TTL_OFFSET];
    if ttl < 2 {
        return None; // last hop: decrementing would put 0 on the wire
    }
    let payload_len = u16::from_be_bytes([raw[13], raw[14]]) as usize;
    let body_end = Header::SIZE + payload_len;
    if raw.len() < body_end {
        return None;
    }

    // Locate the PREVIOUS_HOP TLV inside the body.
    let mut pos = Header::SIZE;
    let mut prev_hop_at: Option<usize> = None;
    while pos + 2 <= body_end {
        let t = raw[pos];
        let len = raw[pos + 1] as usize;
        let start = pos + 2;
        if start + len > body_end {
            return None;
        }
        if t == tlv::PREVIOUS_HOP && len == 6 {
            prev_hop_at = Some(start);
            break;
        }
        pos = start + len;
    }
    let at = prev_hop_at?;

    let mut out = raw.to_vec();
    out[Header::TTL_OFFSET] = ttl - 1;
    out[at..at + 6].copy_from_slice(self_id);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LinkStatus, ProviderType};

    fn limits() -> WireLimits {
        WireLimits::default()
    }

    fn sample_pa() -> Frame {
        Frame::new(
            4,
            7,
            [0xAA; 6],
            Message::Pa(Pa {
                entries: vec![PaEntry {
                    provider_id: [0xAA; 6],
                    provider_type: ProviderType::MobileProvider,
                    position: (100.0, 5.0),
                    destination: (9000.0, 5.0),
                    direction: (1.0, 0.0),
                    platoon_size: 0,
                    available_slots: 0,
                    energy_available_kwh: 22.5,
                    renewable_fraction: 0.0,
                }],
                previous_hop: [0xAA; 6],
            }),
        )
    }

    #[test]
    fn test_header_roundtrip() {
        let frame = sample_pa();
        let bytes = frame.encode_to_vec();
        let header = Header::decode(&bytes).unwrap();
        assert_eq!(header.msg_type, MsgType::Pa);
        assert_eq!(header.ttl, 4);
        assert_eq!(header.seq_num, 7);
        assert_eq!(header.sender_id, [0xAA; 6]);
        assert_eq!(
            header.payload_len as usize,
            bytes.len() - Header::SIZE
        );
    }

    #[test]
    fn test_pa_roundtrip_bytes() {
        let bytes = sample_pa().encode_to_vec();
        let decoded = Frame::decode(&bytes, &limits()).unwrap();
        assert_eq!(decoded.encode_to_vec(), bytes);
    }

    #[test]
    fn test_hello_roundtrip() {
        let hello = Hello {
            neighbors: vec![
                HelloNeighbor {
                    id: [1; 6],
                    link: LinkStatus::Sym,
                    mpr_selected: true,
                },
                HelloNeighbor {
                    id: [2; 6],
                    link: LinkStatus::Asym,
                    mpr_selected: false,
                },
            ],
            attrs: NodeAttributes {
                battery_energy_kwh: 61.0,
                x: 12.5,
                y: -3.0,
                vx: 27.0,
                ..NodeAttributes::default()
            },
            metrics: LinkMetrics {
                etx: 1.2,
                jitter_ms: 4.0,
                willingness: 5,
                lane_weight: 0.25,
                link_stability: 0.9,
            },
            provider: true,
            energy_available_kwh: Some(18.0),
            direction: Some((1.0, 0.0)),
        };
        let frame = Frame::new(1, 3, [9; 6], Message::Hello(hello.clone()));
        let bytes = frame.encode_to_vec();
        let decoded = Frame::decode(&bytes, &limits()).unwrap();
        match &decoded.body {
            Message::Hello(h) => {
                assert_eq!(h, &hello);
            }
            other => panic!("expected Hello, got {:?}", other),
        }
        assert_eq!(decoded.encode_to_vec(), bytes);
    }

    #[test]
    fn test_join_accept_member_list_repeats() {
        let accept = JoinAccept {
            provider_id: [1; 6],
            consumer_id: [2; 6],
            meeting_point: (500.0, 0.0),
            bandwidth_kw: 50.0,
            duration_s: 1440.0,
            platoon_id: Some([7; 6]),
            members: vec![[1; 6], [3; 6], [4; 6]],
        };
        let frame = Frame::new(1, 11, [1; 6], Message::JoinAccept(accept.clone()));
        let bytes = frame.encode_to_vec();
        let decoded = Frame::decode(&bytes, &limits()).unwrap();
        match decoded.body {
            Message::JoinAccept(ref a) => {
                assert_eq!(a.members, accept.members);
                assert_eq!(a.platoon_id, Some([7; 6]));
            }
            other => panic!("expected JoinAccept, got {:?}", other),
        }
        assert_eq!(decoded.encode_to_vec(), bytes);
    }

    #[test]
    fn test_pa_multiple_entries() {
        let mut pa = sample_pa();
        if let Message::Pa(ref mut body) = pa.body {
            body.entries.push(PaEntry {
                provider_id: [0xBB; 6],
                provider_type: ProviderType::Rreh,
                position: (2000.0, 0.0),
                destination: (2000.0, 0.0),
                direction: (0.0, 0.0),
                platoon_size: 0,
                available_slots: 4,
                energy_available_kwh: 150.0,
                renewable_fraction: 1.0,
            });
        }
        let bytes = pa.encode_to_vec();
        let decoded = Frame::decode(&bytes, &limits()).unwrap();
        match decoded.body {
            Message::Pa(ref body) => {
                assert_eq!(body.entries.len(), 2);
                assert_eq!(body.entries[1].provider_id, [0xBB; 6]);
                assert_eq!(body.entries[1].provider_type, ProviderType::Rreh);
            }
            other => panic!("expected Pa, got {:?}", other),
        }
        assert_eq!(decoded.encode_to_vec(), bytes);
    }

    #[test]
    fn test_duplicate_tlv_first_wins() {
        // Hand-build an ACK body with two CONSUMER_ID TLVs.
        let mut w = Writer::new();
        Header {
            msg_type: MsgType::Ack,
            ttl: 1,
            seq_num: 1,
            sender_id: [5; 6],
            payload_len: 24,
        }
        .encode(&mut w);
        w.write_tlv(tlv::CONSUMER_ID, &[1; 6]);
        w.write_tlv(tlv::CONSUMER_ID, &[2; 6]);
        w.write_tlv(tlv::PROVIDER_ID, &[3; 6]);
        let bytes = w.finish();
        let decoded = Frame::decode(&bytes, &limits()).unwrap();
        match decoded.body {
            Message::Ack(a) => {
                assert_eq!(a.consumer_id, [1; 6]);
                assert_eq!(a.provider_id, [3; 6]);
            }
            other => panic!("expected Ack, got {:?}", other),
        }
    }

    #[test]
    fn test_pa_duplicate_entry_field_first_wins() {
        // One entry carrying ENERGY_AVAILABLE and POSITION twice each:
        // the first occurrence sticks, as everywhere else in the codec.
        let mut body = Writer::new();
        body.write_tlv(tlv::PROVIDER_ID, &[1; 6]);
        body.write_tlv(tlv::ENERGY_AVAILABLE, &30.0f32.to_be_bytes());
        body.write_tlv(tlv::ENERGY_AVAILABLE, &99.0f32.to_be_bytes());
        body.write_tlv(tlv::POSITION, &pair_bytes((5.0, 6.0)));
        body.write_tlv(tlv::POSITION, &pair_bytes((7.0, 8.0)));
        body.write_tlv(tlv::PREVIOUS_HOP, &[1; 6]);
        let payload = body.finish();

        let mut w = Writer::new();
        Header {
            msg_type: MsgType::Pa,
            ttl: 2,
            seq_num: 1,
            sender_id: [1; 6],
            payload_len: payload.len() as u16,
        }
        .encode(&mut w);
        w.write_bytes(&payload);

        let decoded = Frame::decode(&w.finish(), &limits()).unwrap();
        match decoded.body {
            Message::Pa(pa) => {
                assert_eq!(pa.entries.len(), 1);
                assert_eq!(pa.entries[0].energy_available_kwh, 30.0);
                assert_eq!(pa.entries[0].position, (5.0, 6.0));
            }
            other => panic!("expected Pa, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tlv_skipped() {
        let mut w = Writer::new();
        Header {
            msg_type: MsgType::Ack,
            ttl: 1,
            seq_num: 1,
            sender_id: [5; 6],
            payload_len: 21,
        }
        .encode(&mut w);
        w.write_tlv(200, &[0xDE, 0xAD]); // unknown type
        w.write_tlv(tlv::CONSUMER_ID, &[1; 6]);
        w.write_tlv(tlv::PROVIDER_ID, &[3; 6]);
        let bytes = w.finish();
        let decoded = Frame::decode(&bytes, &limits()).unwrap();
        assert!(matches!(decoded.body, Message::Ack(_)));
    }

    #[test]
    fn test_truncated_header_rejected() {
        let bytes = sample_pa().encode_to_vec();
        assert_eq!(
            Frame::decode(&bytes[..10], &limits()),
            Err(DecodeError::UnexpectedEof)
        );
    }

    #[test]
    fn test_payload_length_mismatch_rejected() {
        let mut bytes = sample_pa().encode_to_vec();
        // Claim a longer payload than present.
        let bogus = (bytes.len() - Header::SIZE + 5) as u16;
        bytes[13..15].copy_from_slice(&bogus.to_be_bytes());
        assert_eq!(
            Frame::decode(&bytes, &limits()),
            Err(DecodeError::PayloadLengthMismatch)
        );
    }

    #[test]
    fn test_tlv_overrun_rejected() {
        let mut w = Writer::new();
        Header {
            msg_type: MsgType::Ack,
            ttl: 1,
            seq_num: 1,
            sender_id: [5; 6],
            payload_len: 4,
        }
        .encode(&mut w);
        // TLV claims 10 bytes but only 2 follow.
        w.write_bytes(&[tlv::CONSUMER_ID, 10, 0, 0]);
        let bytes = w.finish();
        assert_eq!(
            Frame::decode(&bytes, &limits()),
            Err(DecodeError::TlvOverrun)
        );
    }

    #[test]
    fn test_pa_ttl_bound() {
        let mut frame = sample_pa();
        frame.header.ttl = 9; // above forwardable_ttl_max = 6
        let bytes = frame.encode_to_vec();
        assert_eq!(
            Frame::decode(&bytes, &limits()),
            Err(DecodeError::TtlExceedsMax)
        );
    }

    #[test]
    fn test_sequence_bound() {
        let mut frame = sample_pa();
        frame.header.seq_num = MAX_SEQUENCE_NUMBER + 1;
        let bytes = frame.encode_to_vec();
        assert_eq!(
            Frame::decode(&bytes, &limits()),
            Err(DecodeError::SequenceOutOfRange)
        );
    }

    #[test]
    fn test_pa_missing_previous_hop_rejected() {
        let mut w = Writer::new();
        let body = {
            let mut bw = Writer::new();
            bw.write_tlv(tlv::PROVIDER_ID, &[1; 6]);
            bw.finish()
        };
        Header {
            msg_type: MsgType::Pa,
            ttl: 2,
            seq_num: 1,
            sender_id: [1; 6],
            payload_len: body.len() as u16,
        }
        .encode(&mut w);
        w.write_bytes(&body);
        assert_eq!(
            Frame::decode(&w.finish(), &limits()),
            Err(DecodeError::MissingPreviousHop)
        );
    }

    #[test]
    fn test_forwarded_copy_patches_in_place() {
        let bytes = sample_pa().encode_to_vec();
        let me = [0xBB; 6];
        let fwd = forwarded_copy(&bytes, &me).unwrap();

        assert_eq!(fwd.len(), bytes.len());
        // ttl decremented
        assert_eq!(fwd[Header::TTL_OFFSET], bytes[Header::TTL_OFFSET] - 1);
        // originator unchanged
        assert_eq!(&fwd[7..13], &bytes[7..13]);
        // decodes with the new previous hop
        let decoded = Frame::decode(&fwd, &limits()).unwrap();
        match decoded.body {
            Message::Pa(pa) => assert_eq!(pa.previous_hop, me),
            other => panic!("expected Pa, got {:?}", other),
        }
        // all bytes besides ttl and the hop value are identical
        let diff: Vec<usize> = bytes
            .iter()
            .zip(fwd.iter())
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i)
            .collect();
        assert!(diff.len() <= 7, "only ttl + 6 hop bytes may change: {:?}", diff);
    }

    #[test]
    fn test_forwarded_copy_stops_at_ttl_one() {
        let mut frame = sample_pa();
        frame.header.ttl = 1;
        let bytes = frame.encode_to_vec();
        assert!(forwarded_copy(&bytes, &[0xBB; 6]).is_none());
    }

    #[test]
    fn test_grid_status_roundtrip() {
        let gs = GridStatus {
            hub_id: [0xEE; 6],
            renewable_fraction: 0.8,
            available_power_kw: 150.0,
            max_sessions: 4,
            queue_time_s: 1800.0,
            operational_state: OperationalState::Congested,
            previous_hop: [0xEE; 6],
        };
        let frame = Frame::new(4, 2, [0xEE; 6], Message::GridStatus(gs));
        let bytes = frame.encode_to_vec();
        let decoded = Frame::decode(&bytes, &limits()).unwrap();
        match decoded.body {
            Message::GridStatus(g) => assert_eq!(g, gs),
            other => panic!("expected GridStatus, got {:?}", other),
        }
        assert_eq!(decoded.encode_to_vec(), bytes);
    }

    #[test]
    fn test_platoon_beacon_roundtrip() {
        let beacon = PlatoonBeacon {
            platoon_id: [7; 6],
            head_id: [1; 6],
            position: (1000.0, 3.5),
            velocity: (27.0, 0.0),
            available_slots: 3,
            topology: vec![([1; 6], 0), ([2; 6], 1), ([3; 6], 2)],
            formation: vec![([2; 6], 0.0, 3.0), ([3; 6], 1.5, 6.0)],
        };
        let frame = Frame::new(1, 5, [1; 6], Message::PlatoonBeacon(beacon.clone()));
        let bytes = frame.encode_to_vec();
        let decoded = Frame::decode(&bytes, &limits()).unwrap();
        match decoded.body {
            Message::PlatoonBeacon(ref b) => assert_eq!(b, &beacon),
            other => panic!("expected PlatoonBeacon, got {:?}", other),
        }
        assert_eq!(decoded.encode_to_vec(), bytes);
    }

    #[test]
    fn test_platoon_announce_roundtrip() {
        let ann = PlatoonAnnounce {
            platoon_id: [7; 6],
            head_id: [1; 6],
            position: (1000.0, 3.5),
            destination: (9000.0, 3.5),
            available_slots: 2,
            surplus_energy_kwh: 44.0,
            direction: (1.0, 0.0),
            formation_efficiency: 0.72,
            previous_hop: [1; 6],
        };
        let frame = Frame::new(3, 8, [1; 6], Message::PlatoonAnnounce(ann));
        let bytes = frame.encode_to_vec();
        let decoded = Frame::decode(&bytes, &limits()).unwrap();
        match decoded.body {
            Message::PlatoonAnnounce(a) => assert_eq!(a, ann),
            other => panic!("expected PlatoonAnnounce, got {:?}", other),
        }
        assert_eq!(decoded.encode_to_vec(), bytes);
    }
}

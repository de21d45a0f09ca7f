//! Kafka v2 record batch encoding for the bridge
//!
//! The store treats batch payloads as opaque bytes; this module is where the
//! bridge reads and writes them. It covers the three shapes the transactional
//! core needs: header extraction for append validation, control batches
//! (transaction markers), and data batches for embedded producers and tests.

use crate::error::{GateError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Kafka v2 record batch magic byte
pub(crate) const RECORD_BATCH_MAGIC_V2: i8 = 2;

/// Batch attribute bit: batch is part of a transaction
pub(crate) const ATTR_TRANSACTIONAL_BIT: i16 = 0x10;

/// Batch attribute bit: batch carries a control record
pub(crate) const ATTR_CONTROL_BIT: i16 = 0x20;

/// Size of the fixed batch header up to the records array
const BATCH_HEADER_LEN: usize = 61;

/// Offset of the attributes field, where the CRC span starts
const ATTRIBUTES_POS: usize = 21;

/// Control record types, matching the Kafka control key schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum ControlType {
    Abort = 0,
    Commit = 1,
}

impl ControlType {
    fn from_raw(raw: i16) -> Result<Self> {
        match raw {
            0 => Ok(ControlType::Abort),
            1 => Ok(ControlType::Commit),
            other => Err(GateError::CorruptedBatch(format!(
                "unknown control type {}",
                other
            ))),
        }
    }
}

/// Producer/transaction metadata extracted from a batch header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchInfo {
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: i32,
    pub record_count: i32,
    pub is_transactional: bool,
    pub is_control: bool,
}

impl BatchInfo {
    /// Sequence number of the last record in the batch
    pub fn last_sequence(&self) -> i32 {
        if self.base_sequence < 0 || self.record_count <= 0 {
            self.base_sequence
        } else {
            self.base_sequence.wrapping_add(self.record_count - 1)
        }
    }

    /// True when the batch carries a producer id
    pub fn is_idempotent(&self) -> bool {
        self.producer_id >= 0
    }
}

/// A decoded transaction marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMarker {
    pub control_type: ControlType,
    pub coordinator_epoch: i32,
    pub producer_id: i64,
    pub producer_epoch: i16,
}

/// A single decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

fn put_varint(buf: &mut BytesMut, value: i32) {
    let mut zigzag = ((value << 1) ^ (value >> 31)) as u32;
    loop {
        if zigzag & !0x7f == 0 {
            buf.put_u8(zigzag as u8);
            return;
        }
        buf.put_u8((zigzag as u8 & 0x7f) | 0x80);
        zigzag >>= 7;
    }
}

fn get_varint(buf: &mut impl Buf) -> Result<i32> {
    let mut value: u32 = 0;
    let mut shift = 0;
    loop {
        if !buf.has_remaining() || shift > 28 {
            return Err(GateError::CorruptedBatch("truncated varint".to_string()));
        }
        let byte = buf.get_u8();
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(((value >> 1) as i32) ^ -((value & 1) as i32))
}

fn varint_len(value: i32) -> usize {
    let mut zigzag = ((value << 1) ^ (value >> 31)) as u32;
    let mut len = 1;
    while zigzag & !0x7f != 0 {
        zigzag >>= 7;
        len += 1;
    }
    len
}

/// Extract producer metadata from an encoded batch without decoding records.
pub fn parse_batch_info(payload: &Bytes) -> Result<BatchInfo> {
    if payload.len() < BATCH_HEADER_LEN {
        return Err(GateError::CorruptedBatch(format!(
            "batch too short: {} bytes",
            payload.len()
        )));
    }
    let mut header = payload.clone();
    header.advance(8); // base offset
    header.advance(4); // batch length
    header.advance(4); // partition leader epoch
    let magic = header.get_i8();
    if magic != RECORD_BATCH_MAGIC_V2 {
        return Err(GateError::CorruptedBatch(format!(
            "unsupported batch magic {}",
            magic
        )));
    }
    let crc = header.get_u32();
    let computed = crc32fast::hash(&payload[ATTRIBUTES_POS..]);
    if crc != computed {
        return Err(GateError::CorruptedBatch(format!(
            "crc mismatch: stored {:#x}, computed {:#x}",
            crc, computed
        )));
    }
    let attributes = header.get_i16();
    header.advance(4); // last offset delta
    header.advance(16); // base + max timestamps
    let producer_id = header.get_i64();
    let producer_epoch = header.get_i16();
    let base_sequence = header.get_i32();
    let record_count = header.get_i32();

    Ok(BatchInfo {
        producer_id,
        producer_epoch,
        base_sequence,
        record_count,
        is_transactional: attributes & ATTR_TRANSACTIONAL_BIT != 0,
        is_control: attributes & ATTR_CONTROL_BIT != 0,
    })
}

struct BatchBuilder {
    buf: BytesMut,
    crc_pos: usize,
    batch_length_pos: usize,
}

impl BatchBuilder {
    fn new(
        base_offset: i64,
        attributes: i16,
        last_offset_delta: i32,
        producer_id: i64,
        producer_epoch: i16,
        base_sequence: i32,
        record_count: i32,
    ) -> Self {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_i64(base_offset);
        let batch_length_pos = buf.len();
        buf.put_i32(0); // patched in finish()
        buf.put_i32(0); // partition leader epoch
        buf.put_i8(RECORD_BATCH_MAGIC_V2);
        let crc_pos = buf.len();
        buf.put_u32(0); // patched in finish()
        buf.put_i16(attributes);
        buf.put_i32(last_offset_delta);
        let timestamp = chrono::Utc::now().timestamp_millis();
        buf.put_i64(timestamp);
        buf.put_i64(timestamp);
        buf.put_i64(producer_id);
        buf.put_i16(producer_epoch);
        buf.put_i32(base_sequence);
        buf.put_i32(record_count);
        Self {
            buf,
            crc_pos,
            batch_length_pos,
        }
    }

    fn put_record(&mut self, offset_delta: i32, key: Option<&[u8]>, value: Option<&[u8]>) {
        let key_body_len = match key {
            Some(k) => varint_len(k.len() as i32) + k.len(),
            None => varint_len(-1),
        };
        let value_body_len = match value {
            Some(v) => varint_len(v.len() as i32) + v.len(),
            None => varint_len(-1),
        };
        // attributes + timestamp delta + offset delta + key + value + headers count
        let body_len =
            (1 + varint_len(0) + varint_len(offset_delta) + key_body_len + value_body_len + varint_len(0)) as i32;

        put_varint(&mut self.buf, body_len);
        self.buf.put_i8(0); // record attributes
        put_varint(&mut self.buf, 0); // timestamp delta
        put_varint(&mut self.buf, offset_delta);
        match key {
            Some(k) => {
                put_varint(&mut self.buf, k.len() as i32);
                self.buf.put_slice(k);
            }
            None => put_varint(&mut self.buf, -1),
        }
        match value {
            Some(v) => {
                put_varint(&mut self.buf, v.len() as i32);
                self.buf.put_slice(v);
            }
            None => put_varint(&mut self.buf, -1),
        }
        put_varint(&mut self.buf, 0); // headers
    }

    fn finish(mut self) -> Bytes {
        let crc = crc32fast::hash(&self.buf[ATTRIBUTES_POS..]);
        self.buf[self.crc_pos..self.crc_pos + 4].copy_from_slice(&crc.to_be_bytes());
        let batch_length = (self.buf.len() - 12) as i32;
        self.buf[self.batch_length_pos..self.batch_length_pos + 4]
            .copy_from_slice(&batch_length.to_be_bytes());
        self.buf.freeze()
    }
}

/// Build a control batch (transaction marker) for commit or abort.
///
/// The marker key carries `{version, type}`, the value carries `{version,
/// coordinator_epoch}` so a partition replaying its log can fence markers
/// from a stale coordinator.
pub fn encode_control_batch(
    base_offset: i64,
    producer_id: i64,
    producer_epoch: i16,
    control_type: ControlType,
    coordinator_epoch: i32,
) -> Bytes {
    let mut builder = BatchBuilder::new(
        base_offset,
        ATTR_TRANSACTIONAL_BIT | ATTR_CONTROL_BIT,
        0,
        producer_id,
        producer_epoch,
        -1, // control batches carry no sequence
        1,
    );

    let mut key = BytesMut::with_capacity(4);
    key.put_i16(0); // control key version
    key.put_i16(control_type as i16);

    let mut value = BytesMut::with_capacity(6);
    value.put_i16(0); // marker value version
    value.put_i32(coordinator_epoch);

    builder.put_record(0, Some(&key), Some(&value));
    builder.finish()
}

/// Decode a control batch into the marker it carries.
pub fn decode_control_batch(payload: &Bytes) -> Result<ControlMarker> {
    let info = parse_batch_info(payload)?;
    if !info.is_control {
        return Err(GateError::CorruptedBatch(
            "not a control batch".to_string(),
        ));
    }
    let records = decode_records(payload, &info)?;
    let record = records
        .first()
        .ok_or_else(|| GateError::CorruptedBatch("empty control batch".to_string()))?;

    let mut key = record
        .key
        .clone()
        .ok_or_else(|| GateError::CorruptedBatch("control record without key".to_string()))?;
    if key.len() < 4 {
        return Err(GateError::CorruptedBatch("short control key".to_string()));
    }
    let _version = key.get_i16();
    let control_type = ControlType::from_raw(key.get_i16())?;

    let coordinator_epoch = match &record.value {
        Some(value) if value.len() >= 6 => {
            let mut value = value.clone();
            let _version = value.get_i16();
            value.get_i32()
        }
        _ => -1,
    };

    Ok(ControlMarker {
        control_type,
        coordinator_epoch,
        producer_id: info.producer_id,
        producer_epoch: info.producer_epoch,
    })
}

/// Rewrite the base offset field of an encoded batch to the offset the store
/// assigned. The CRC span starts after the offset, so no recompute is needed.
pub fn with_base_offset(payload: &Bytes, base_offset: i64) -> Bytes {
    let mut patched = payload.to_vec();
    if patched.len() >= 8 {
        patched[..8].copy_from_slice(&base_offset.to_be_bytes());
    }
    Bytes::from(patched)
}

/// Build a data batch from record key/value pairs.
pub fn encode_data_batch(
    base_offset: i64,
    producer_id: i64,
    producer_epoch: i16,
    base_sequence: i32,
    is_transactional: bool,
    records: &[(Option<&[u8]>, &[u8])],
) -> Bytes {
    let attributes = if is_transactional {
        ATTR_TRANSACTIONAL_BIT
    } else {
        0
    };
    let mut builder = BatchBuilder::new(
        base_offset,
        attributes,
        records.len().saturating_sub(1) as i32,
        producer_id,
        producer_epoch,
        base_sequence,
        records.len() as i32,
    );
    for (delta, (key, value)) in records.iter().enumerate() {
        builder.put_record(delta as i32, *key, Some(value));
    }
    builder.finish()
}

/// Decode the records of a data or control batch.
pub fn decode_batch_records(payload: &Bytes) -> Result<Vec<DecodedRecord>> {
    let info = parse_batch_info(payload)?;
    decode_records(payload, &info)
}

fn decode_records(payload: &Bytes, info: &BatchInfo) -> Result<Vec<DecodedRecord>> {
    let mut buf = payload.slice(BATCH_HEADER_LEN..);
    let mut records = Vec::with_capacity(info.record_count.max(0) as usize);
    for _ in 0..info.record_count {
        let body_len = get_varint(&mut buf)?;
        if body_len < 0 || buf.remaining() < body_len as usize {
            return Err(GateError::CorruptedBatch("truncated record".to_string()));
        }
        let mut body = buf.slice(..body_len as usize);
        buf.advance(body_len as usize);

        body.advance(1); // record attributes
        let _timestamp_delta = get_varint(&mut body)?;
        let _offset_delta = get_varint(&mut body)?;

        let key_len = get_varint(&mut body)?;
        let key = if key_len < 0 {
            None
        } else {
            if body.remaining() < key_len as usize {
                return Err(GateError::CorruptedBatch("truncated key".to_string()));
            }
            let key = body.slice(..key_len as usize);
            body.advance(key_len as usize);
            Some(key)
        };

        let value_len = get_varint(&mut body)?;
        let value = if value_len < 0 {
            None
        } else {
            if body.remaining() < value_len as usize {
                return Err(GateError::CorruptedBatch("truncated value".to_string()));
            }
            let value = body.slice(..value_len as usize);
            body.advance(value_len as usize);
            Some(value)
        };

        records.push(DecodedRecord { key, value });
    }
    Ok(records)
}

//! Portion 持久化表示
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ MAGIC        "PRTN" (4 bytes)    │
//! │ version      (u16 LE) = 1        │
//! │ codec        (u8)  0=None 1=LZ4  │
//! │ uncomp_size  (u32 LE)            │
//! │ body_size    (u32 LE)            │
//! │ body         (可能经 LZ4 压缩)    │
//! │ CRC32        (u32 LE)            │
//! └──────────────────────────────────┘
//! ```
//!
//! body 字段顺序固定，可选字段由 flags 位图标记。

use std::io::{Read, Write};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crate::common::{GranuleError, Result, Snapshot, Timestamp};
use crate::portion::{BlobRange, PortionKind, PortionMeta, PortionRecord};
use crate::tx::TransactionContext;

const MAGIC: &[u8; 4] = b"PRTN";
const VERSION: u16    = 1;
const HEADER_LEN: usize = 4 + 2 + 1 + 4 + 4;

const HAS_WRITE_ID:   u8 = 1 << 0;
const HAS_COMMIT:     u8 = 1 << 1;
const HAS_REMOVE:     u8 = 1 << 2;
const HAS_EVENT_TIME: u8 = 1 << 3;
const HAS_TIER:       u8 = 1 << 4;

// ── 压缩选项 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistCodec { None, Lz4 }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistOptions {
    pub codec:               PersistCodec,
    /// body 小于该值时不压缩
    pub lz4_threshold_bytes: usize,
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self { codec: PersistCodec::Lz4, lz4_threshold_bytes: 256 }
    }
}

fn compress(data: &[u8], codec: PersistCodec) -> Result<Vec<u8>> {
    match codec {
        PersistCodec::None => Ok(data.to_vec()),
        PersistCodec::Lz4  =>
            lz4::block::compress(data, None, false)
                .map_err(|e| GranuleError::Codec(e.to_string())),
    }
}

fn decompress(data: &[u8], codec: PersistCodec, uncompressed_len: usize) -> Result<Vec<u8>> {
    match codec {
        PersistCodec::None => Ok(data.to_vec()),
        PersistCodec::Lz4  => {
            let len = i32::try_from(uncompressed_len)
                .map_err(|_| GranuleError::Codec("uncompressed size overflow".into()))?;
            lz4::block::decompress(data, Some(len))
                .map_err(|e| GranuleError::Codec(e.to_string()))
        }
    }
}

// ── PortionAccessor ───────────────────────────────────────────────────────────

/// 把一个 portion 编码为可写入事务的字节串
pub struct PortionAccessor<'a> {
    portion: &'a PortionRecord,
}

impl<'a> PortionAccessor<'a> {
    pub fn new(portion: &'a PortionRecord) -> Self { Self { portion } }

    pub fn encode(&self, options: PersistOptions) -> Result<Vec<u8>> {
        let body = self.encode_body()?;
        let codec = if body.len() >= options.lz4_threshold_bytes { options.codec } else { PersistCodec::None };
        let payload = compress(&body, codec)?;

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + 4);
        out.write_all(MAGIC)?;
        out.write_u16::<LittleEndian>(VERSION)?;
        out.write_u8(match codec { PersistCodec::None => 0, PersistCodec::Lz4 => 1 })?;
        out.write_u32::<LittleEndian>(len_u32(body.len())?)?;
        out.write_u32::<LittleEndian>(len_u32(payload.len())?)?;
        out.write_all(&payload)?;
        let crc = crc32fast::hash(&out);
        out.write_u32::<LittleEndian>(crc)?;
        Ok(out)
    }

    /// 编码后写入事务写集合
    pub fn save_to_database(&self, txc: &mut dyn TransactionContext) -> Result<()> {
        let bytes = self.encode(txc.persist_options())?;
        txc.write_portion(self.portion.path_id, self.portion.portion_id, bytes);
        Ok(())
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        let p = self.portion;
        let mut flags = 0u8;
        if p.insert_write_id.is_some()     { flags |= HAS_WRITE_ID; }
        if p.commit_snapshot.is_some()     { flags |= HAS_COMMIT; }
        if p.remove_snapshot.is_some()     { flags |= HAS_REMOVE; }
        if p.meta.max_event_time.is_some() { flags |= HAS_EVENT_TIME; }
        if p.meta.tier.is_some()           { flags |= HAS_TIER; }

        let mut w = Vec::new();
        w.write_u64::<LittleEndian>(p.path_id)?;
        w.write_u64::<LittleEndian>(p.portion_id)?;
        w.write_u8(flags)?;
        if let Some(id) = p.insert_write_id {
            w.write_u64::<LittleEndian>(id)?;
        }
        if let Some(s) = p.commit_snapshot {
            write_snapshot(&mut w, s)?;
        }
        if let Some(s) = p.remove_snapshot {
            write_snapshot(&mut w, s)?;
        }
        w.write_u8(p.kind.as_u8())?;
        w.write_u64::<LittleEndian>(p.schema_version)?;
        w.write_u64::<LittleEndian>(p.meta.num_rows)?;
        w.write_u64::<LittleEndian>(p.meta.raw_bytes)?;
        write_bytes(&mut w, &p.meta.index_key_start)?;
        write_bytes(&mut w, &p.meta.index_key_end)?;
        if let Some(t) = p.meta.max_event_time {
            w.write_u64::<LittleEndian>(t.as_micros())?;
        }
        if let Some(tier) = &p.meta.tier {
            write_bytes(&mut w, tier.as_bytes())?;
        }
        w.write_u32::<LittleEndian>(len_u32(p.blobs.len())?)?;
        for b in &p.blobs {
            write_bytes(&mut w, b.blob_id.as_bytes())?;
            w.write_u64::<LittleEndian>(b.offset)?;
            w.write_u64::<LittleEndian>(b.size)?;
        }
        Ok(w)
    }

    /// 校验 magic / 版本 / CRC 后还原 portion
    pub fn decode(data: &[u8]) -> Result<PortionRecord> {
        if data.len() < HEADER_LEN + 4 {
            return Err(GranuleError::Codec("portion record too short".into()));
        }
        let crc_at = data.len() - 4;
        let stored_crc = (&data[crc_at..]).read_u32::<LittleEndian>()?;
        if stored_crc != crc32fast::hash(&data[..crc_at]) {
            return Err(GranuleError::ChecksumMismatch);
        }

        let mut r = &data[..crc_at];
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(GranuleError::Codec("bad magic".into()));
        }
        let version = r.read_u16::<LittleEndian>()?;
        if version != VERSION {
            return Err(GranuleError::Codec(format!("unsupported version {version}")));
        }
        let codec = match r.read_u8()? {
            0 => PersistCodec::None,
            1 => PersistCodec::Lz4,
            c => return Err(GranuleError::Codec(format!("unknown codec {c}"))),
        };
        let uncomp_size = r.read_u32::<LittleEndian>()? as usize;
        let body_size   = r.read_u32::<LittleEndian>()? as usize;
        if r.len() != body_size {
            return Err(GranuleError::Codec("body size mismatch".into()));
        }
        let body = decompress(r, codec, uncomp_size)?;
        decode_body(&body)
    }
}

fn decode_body(body: &[u8]) -> Result<PortionRecord> {
    let mut r = body;
    let path_id    = r.read_u64::<LittleEndian>()?;
    let portion_id = r.read_u64::<LittleEndian>()?;
    let flags      = r.read_u8()?;
    let insert_write_id = if flags & HAS_WRITE_ID != 0 { Some(r.read_u64::<LittleEndian>()?) } else { None };
    let commit_snapshot = if flags & HAS_COMMIT != 0 { Some(read_snapshot(&mut r)?) } else { None };
    let remove_snapshot = if flags & HAS_REMOVE != 0 { Some(read_snapshot(&mut r)?) } else { None };
    let kind_raw = r.read_u8()?;
    let kind = PortionKind::from_u8(kind_raw)
        .ok_or_else(|| GranuleError::Codec(format!("unknown portion kind {kind_raw}")))?;
    let schema_version = r.read_u64::<LittleEndian>()?;
    let num_rows  = r.read_u64::<LittleEndian>()?;
    let raw_bytes = r.read_u64::<LittleEndian>()?;
    let index_key_start = read_bytes(&mut r)?;
    let index_key_end   = read_bytes(&mut r)?;
    let max_event_time = if flags & HAS_EVENT_TIME != 0 {
        Some(Timestamp::from_micros(r.read_u64::<LittleEndian>()?))
    } else {
        None
    };
    let tier = if flags & HAS_TIER != 0 { Some(read_string(&mut r)?) } else { None };
    let num_blobs = r.read_u32::<LittleEndian>()? as usize;
    let mut blobs = Vec::with_capacity(num_blobs.min(1024));
    for _ in 0..num_blobs {
        let blob_id = read_string(&mut r)?;
        let offset  = r.read_u64::<LittleEndian>()?;
        let size    = r.read_u64::<LittleEndian>()?;
        blobs.push(BlobRange { blob_id, offset, size });
    }
    if !r.is_empty() {
        return Err(GranuleError::Codec(format!("{} trailing bytes", r.len())));
    }
    Ok(PortionRecord {
        path_id, portion_id, insert_write_id, commit_snapshot, remove_snapshot,
        kind, schema_version,
        meta: PortionMeta { num_rows, raw_bytes, index_key_start, index_key_end, max_event_time, tier },
        blobs,
    })
}

// ── 辅助 ──────────────────────────────────────────────────────────────────────

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| GranuleError::Codec(format!("length {len} overflows u32")))
}

fn write_snapshot(w: &mut Vec<u8>, s: Snapshot) -> Result<()> {
    w.write_u64::<LittleEndian>(s.plan_step)?;
    w.write_u64::<LittleEndian>(s.tx_id)?;
    Ok(())
}

fn read_snapshot(r: &mut &[u8]) -> Result<Snapshot> {
    let plan_step = r.read_u64::<LittleEndian>()?;
    let tx_id     = r.read_u64::<LittleEndian>()?;
    Ok(Snapshot { plan_step, tx_id })
}

fn write_bytes(w: &mut Vec<u8>, b: &[u8]) -> Result<()> {
    w.write_u32::<LittleEndian>(len_u32(b.len())?)?;
    w.write_all(b)?;
    Ok(())
}

fn read_bytes(r: &mut &[u8]) -> Result<Vec<u8>> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    if len > r.len() {
        return Err(GranuleError::Codec("truncated byte string".into()));
    }
    let (head, tail) = r.split_at(len);
    *r = tail;
    Ok(head.to_vec())
}

fn read_string(r: &mut &[u8]) -> Result<String> {
    String::from_utf8(read_bytes(r)?).map_err(|e| GranuleError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample() -> PortionRecord {
        let meta = PortionMeta {
            num_rows: 1200,
            raw_bytes: 96_000,
            index_key_start: b"2024-01-01".to_vec(),
            index_key_end: b"2024-01-31".to_vec(),
            max_event_time: Some(Timestamp::from_secs(1_700_000_000) + Duration::from_millis(5)),
            tier: Some("cold".into()),
        };
        let blobs = (0..40).map(|i| BlobRange::new("blob-00000000000000000001", i * 4096, 4096)).collect();
        let mut p = PortionRecord::pending(9, 42, 77, meta).with_blobs(blobs);
        p.set_commit_snapshot(Snapshot::new(100, 5));
        p.with_remove_snapshot(Snapshot::new(101, 0))
    }

    #[test]
    fn compressed_record_restores_every_field() {
        let p = sample();
        let bytes = PortionAccessor::new(&p).encode(PersistOptions::default()).unwrap();
        assert_eq!(bytes[6], 1, "large body should be lz4 compressed");
        assert_eq!(PortionAccessor::decode(&bytes).unwrap(), p);
    }

    #[test]
    fn small_record_stays_plain() {
        let p = PortionRecord::committed(1, 2, Snapshot::new(3, 4), PortionMeta::default());
        let bytes = PortionAccessor::new(&p).encode(PersistOptions::default()).unwrap();
        assert_eq!(bytes[6], 0);
        assert_eq!(PortionAccessor::decode(&bytes).unwrap(), p);
    }

    #[test]
    fn corruption_is_detected() {
        let p = sample();
        let mut bytes = PortionAccessor::new(&p).encode(PersistOptions::default()).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        assert!(matches!(PortionAccessor::decode(&bytes), Err(GranuleError::ChecksumMismatch)));
        assert!(PortionAccessor::decode(&bytes[..8]).is_err());
    }
}

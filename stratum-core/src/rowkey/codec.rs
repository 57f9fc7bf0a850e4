//! Binary row-key codec
//!
//! Layout: metric name (NUL-terminated) · tier timestamp (8 bytes,
//! big-endian, so keys sort numerically) · optional data-type section
//! (`0x00` marker, u8 length, type bytes — omitted entirely for the
//! legacy sentinel type, keeping old rows readable) · escaped
//! `tag=value:` pairs. `:`, `=` and `\` inside tag names and values are
//! escaped with `\`.
//!
//! The "end search key" variant writes a `0xFF` marker in place of the
//! type section. It is only ever used as an exclusive upper bound for
//! range scans (0xFF cannot start a UTF-8 tag string) and is never
//! stored; the decoder rejects it.

use super::{RowKey, LEGACY_DATA_TYPE};
use crate::{Result, StratumError, Tags, Timestamp};
use bytes::{BufMut, Bytes, BytesMut};

const TYPE_MARKER: u8 = 0x00;
const SEARCH_MARKER: u8 = 0xFF;

/// Encode a row key to its byte-comparable form
pub fn encode(key: &RowKey) -> Bytes {
    debug_assert!(!key.metric().contains('\0'));

    let mut buf = BytesMut::with_capacity(key.metric().len() + 16);
    buf.put_slice(key.metric().as_bytes());
    buf.put_u8(0);
    buf.put_i64(key.tier_timestamp());

    if key.data_type() != LEGACY_DATA_TYPE {
        debug_assert!(key.data_type().len() <= u8::MAX as usize);
        buf.put_u8(TYPE_MARKER);
        buf.put_u8(key.data_type().len() as u8);
        buf.put_slice(key.data_type().as_bytes());
    }

    encode_tags(&mut buf, key.tags());
    buf.freeze()
}

/// Build the inclusive-start / exclusive-end byte bounds covering every
/// row key of a (metric, tier) pair, regardless of data type and tags
pub fn search_bounds(metric: &str, tier: Timestamp) -> (Bytes, Bytes) {
    let mut start = BytesMut::with_capacity(metric.len() + 10);
    start.put_slice(metric.as_bytes());
    start.put_u8(0);
    start.put_i64(tier);

    let mut end = BytesMut::with_capacity(metric.len() + 10);
    end.put_slice(&start);
    end.put_u8(SEARCH_MARKER);

    (start.freeze(), end.freeze())
}

/// Decode a stored row key. Rows written before the data-type section
/// existed decode with the legacy sentinel type.
pub fn decode(bytes: &[u8]) -> Result<RowKey> {
    let nul = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| malformed("missing metric terminator"))?;
    let metric = std::str::from_utf8(&bytes[..nul])
        .map_err(|_| malformed("metric is not valid UTF-8"))?
        .to_string();

    let rest = &bytes[nul + 1..];
    if rest.len() < 8 {
        return Err(malformed("truncated tier timestamp"));
    }
    let tier = i64::from_be_bytes(rest[..8].try_into().unwrap());
    let rest = &rest[8..];

    let (data_type, rest) = match rest.first() {
        None => (LEGACY_DATA_TYPE.to_string(), rest),
        Some(&TYPE_MARKER) => {
            if rest.len() < 2 {
                return Err(malformed("truncated data-type section"));
            }
            let len = rest[1] as usize;
            if rest.len() < 2 + len {
                return Err(malformed("truncated data-type bytes"));
            }
            let dt = std::str::from_utf8(&rest[2..2 + len])
                .map_err(|_| malformed("data type is not valid UTF-8"))?
                .to_string();
            (dt, &rest[2 + len..])
        }
        Some(&SEARCH_MARKER) => {
            return Err(malformed("search marker in stored key"));
        }
        // No marker byte: a pre-upgrade row, tags start immediately
        Some(_) => (LEGACY_DATA_TYPE.to_string(), rest),
    };

    let tags = decode_tags(rest)?;
    Ok(RowKey::new(metric, tier, data_type, tags))
}

fn encode_tags(buf: &mut BytesMut, tags: &Tags) {
    for (name, value) in tags {
        escape_into(buf, name);
        buf.put_u8(b'=');
        escape_into(buf, value);
        buf.put_u8(b':');
    }
}

fn escape_into(buf: &mut BytesMut, s: &str) {
    for &b in s.as_bytes() {
        if b == b':' || b == b'=' || b == b'\\' {
            buf.put_u8(b'\\');
        }
        buf.put_u8(b);
    }
}

fn decode_tags(bytes: &[u8]) -> Result<Tags> {
    let mut tags = Tags::new();
    let mut name: Option<String> = None;
    let mut current = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 1;
                match bytes.get(i) {
                    Some(&b) => current.push(b),
                    None => return Err(malformed("dangling escape in tags")),
                }
            }
            b'=' => {
                if name.is_some() {
                    return Err(malformed("unescaped '=' in tag value"));
                }
                name = Some(take_utf8(&mut current)?);
            }
            b':' => {
                let name = name
                    .take()
                    .ok_or_else(|| malformed("tag pair without '='"))?;
                tags.insert(name, take_utf8(&mut current)?);
            }
            b => current.push(b),
        }
        i += 1;
    }

    if name.is_some() || !current.is_empty() {
        return Err(malformed("trailing unterminated tag pair"));
    }
    Ok(tags)
}

fn take_utf8(buf: &mut Vec<u8>) -> Result<String> {
    String::from_utf8(std::mem::take(buf)).map_err(|_| malformed("tag is not valid UTF-8"))
}

fn malformed(msg: &str) -> StratumError {
    StratumError::MalformedRowKey(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_round_trip_plain() {
        let key = RowKey::new(
            "cpu_usage",
            1_814_400_000,
            "long",
            tags(&[("host", "web-1"), ("dc", "east")]),
        );
        let decoded = decode(&encode(&key)).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_round_trip_legacy_omits_type_section() {
        let key = RowKey::new("cpu", 0, LEGACY_DATA_TYPE, tags(&[("host", "a")]));
        let encoded = encode(&key);
        // metric + NUL + 8-byte tier, then the tag bytes directly
        assert_eq!(&encoded[..4], b"cpu\0");
        assert_eq!(encoded[12], b'h');
        assert_eq!(decode(&encoded).unwrap(), key);
    }

    #[test]
    fn test_round_trip_escape_characters() {
        let key = RowKey::new(
            "m",
            1000,
            "double",
            tags(&[("a:b", "c=d"), ("e\\f", "g:h=i")]),
        );
        assert_eq!(decode(&encode(&key)).unwrap(), key);
    }

    #[test]
    fn test_round_trip_no_tags() {
        let key = RowKey::new("m", -2000, "string", BTreeMap::new());
        assert_eq!(decode(&encode(&key)).unwrap(), key);
    }

    #[test]
    fn test_tier_sorts_big_endian() {
        let a = encode(&RowKey::new("m", 1000, "long", Tags::new()));
        let b = encode(&RowKey::new("m", 2000, "long", Tags::new()));
        assert!(a < b);
    }

    #[test]
    fn test_search_bounds_cover_all_types() {
        let (start, end) = search_bounds("m", 1000);
        let legacy = encode(&RowKey::new("m", 1000, LEGACY_DATA_TYPE, tags(&[("t", "v")])));
        let typed = encode(&RowKey::new("m", 1000, "long", tags(&[("t", "v")])));
        let bare = encode(&RowKey::new("m", 1000, LEGACY_DATA_TYPE, Tags::new()));
        for key in [&legacy, &typed, &bare] {
            assert!(key >= &start && key < &end);
        }
        let next_tier = encode(&RowKey::new("m", 2000, "long", Tags::new()));
        assert!(next_tier >= end);
    }

    #[test]
    fn test_decode_rejects_search_marker() {
        let (_, end) = search_bounds("m", 1000);
        assert!(decode(&end).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"no-terminator").is_err());
        assert!(decode(b"m\0short").is_err());
        let mut key = b"m\0".to_vec();
        key.extend_from_slice(&1000i64.to_be_bytes());
        key.extend_from_slice(b"dangling\\");
        assert!(decode(&key).is_err());
    }
}

//! Point-value codecs and the pluggable point-factory registry
//!
//! Longs are stored as minimal-length big-endian two's complement.
//! Legacy rows store doubles with a one-byte type tag ahead of the IEEE
//! bytes; whether a legacy column holds a long or a double is told by
//! the reserved bit of its offset, never sniffed from the value bytes.

use crate::rowkey::LEGACY_DATA_TYPE;
use crate::{PointValue, Result, StratumError};
use std::collections::HashMap;
use std::sync::Arc;

/// Legacy value tag for a 4-byte IEEE float (accepted on decode only)
const LEGACY_FLOAT_TAG: u8 = 0x01;
/// Legacy value tag for an 8-byte IEEE double
const LEGACY_DOUBLE_TAG: u8 = 0x02;
/// Type tag for the generic string encoding
const STRING_TAG: u8 = 0x03;

/// Encode an i64 as minimal-length big-endian two's complement
pub fn encode_varlong(v: i64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let first = bytes[start];
        let next = bytes[start + 1];
        let redundant = (first == 0x00 && next < 0x80) || (first == 0xFF && next >= 0x80);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

/// Decode a minimal-length big-endian i64, sign-extending from the
/// first byte
pub fn decode_varlong(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(StratumError::Decode(format!(
            "var-long must be 1..=8 bytes, got {}",
            bytes.len()
        )));
    }
    let mut v: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in bytes {
        v = (v << 8) | i64::from(b);
    }
    Ok(v)
}

/// Encode a value in the legacy row format. Returns the value bytes and
/// the offset type bit (set for doubles).
pub fn encode_legacy(value: &PointValue) -> Result<(Vec<u8>, bool)> {
    match value {
        PointValue::Long(v) => Ok((encode_varlong(*v), false)),
        PointValue::Double(v) => {
            let mut bytes = Vec::with_capacity(9);
            bytes.push(LEGACY_DOUBLE_TAG);
            bytes.extend_from_slice(&v.to_be_bytes());
            Ok((bytes, true))
        }
        PointValue::Text(_) => Err(StratumError::Decode(
            "legacy rows only hold longs and doubles".to_string(),
        )),
    }
}

/// Decode a legacy value. `double_bit` comes from the column offset's
/// reserved bit.
pub fn decode_legacy(bytes: &[u8], double_bit: bool) -> Result<PointValue> {
    if !double_bit {
        return Ok(PointValue::Long(decode_varlong(bytes)?));
    }
    match bytes.split_first() {
        Some((&LEGACY_DOUBLE_TAG, rest)) if rest.len() == 8 => Ok(PointValue::Double(
            f64::from_be_bytes(rest.try_into().unwrap()),
        )),
        Some((&LEGACY_FLOAT_TAG, rest)) if rest.len() == 4 => Ok(PointValue::Double(f64::from(
            f32::from_be_bytes(rest.try_into().unwrap()),
        ))),
        _ => Err(StratumError::Decode(
            "malformed legacy double value".to_string(),
        )),
    }
}

/// Encoder/decoder for one data type. Implementations must be pure;
/// both the write and read paths share one registry.
pub trait PointFactory: Send + Sync {
    /// Data-type tag stored in row keys
    fn data_type(&self) -> &'static str;

    /// Encode a value to its column bytes
    fn encode(&self, value: &PointValue) -> Result<Vec<u8>>;

    /// Decode column bytes back to a value
    fn decode(&self, bytes: &[u8]) -> Result<PointValue>;
}

/// Factory for plain 64-bit integers
pub struct LongFactory;

impl PointFactory for LongFactory {
    fn data_type(&self) -> &'static str {
        "long"
    }

    fn encode(&self, value: &PointValue) -> Result<Vec<u8>> {
        match value {
            PointValue::Long(v) => Ok(encode_varlong(*v)),
            other => Err(type_mismatch("long", other)),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<PointValue> {
        Ok(PointValue::Long(decode_varlong(bytes)?))
    }
}

/// Factory for 64-bit floats
pub struct DoubleFactory;

impl PointFactory for DoubleFactory {
    fn data_type(&self) -> &'static str {
        "double"
    }

    fn encode(&self, value: &PointValue) -> Result<Vec<u8>> {
        match value {
            PointValue::Double(v) => Ok(v.to_be_bytes().to_vec()),
            other => Err(type_mismatch("double", other)),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<PointValue> {
        if bytes.len() != 8 {
            return Err(StratumError::Decode(format!(
                "double must be 8 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(PointValue::Double(f64::from_be_bytes(
            bytes.try_into().unwrap(),
        )))
    }
}

/// Factory for UTF-8 strings, using the generic type-tagged encoding
pub struct StringFactory;

impl PointFactory for StringFactory {
    fn data_type(&self) -> &'static str {
        "string"
    }

    fn encode(&self, value: &PointValue) -> Result<Vec<u8>> {
        match value {
            PointValue::Text(s) => {
                let mut bytes = Vec::with_capacity(s.len() + 1);
                bytes.push(STRING_TAG);
                bytes.extend_from_slice(s.as_bytes());
                Ok(bytes)
            }
            other => Err(type_mismatch("string", other)),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<PointValue> {
        match bytes.split_first() {
            Some((&STRING_TAG, rest)) => Ok(PointValue::Text(
                std::str::from_utf8(rest)
                    .map_err(|_| StratumError::Decode("string value is not UTF-8".to_string()))?
                    .to_string(),
            )),
            _ => Err(StratumError::Decode("missing string type tag".to_string())),
        }
    }
}

fn type_mismatch(expected: &str, got: &PointValue) -> StratumError {
    StratumError::Decode(format!("{expected} factory cannot encode {got:?}"))
}

/// Registry of point factories keyed by data type. The legacy format is
/// handled here directly since its decoding needs the offset bit.
pub struct PointFactoryRegistry {
    factories: HashMap<&'static str, Arc<dyn PointFactory>>,
}

impl Default for PointFactoryRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(Arc::new(LongFactory));
        registry.register(Arc::new(DoubleFactory));
        registry.register(Arc::new(StringFactory));
        registry
    }
}

impl PointFactoryRegistry {
    /// Register a factory, replacing any previous one for the same type
    pub fn register(&mut self, factory: Arc<dyn PointFactory>) {
        self.factories.insert(factory.data_type(), factory);
    }

    fn get(&self, data_type: &str) -> Result<&Arc<dyn PointFactory>> {
        self.factories
            .get(data_type)
            .ok_or_else(|| StratumError::UnknownDataType(data_type.to_string()))
    }

    /// Pick the row data type for a value. Legacy clusters fold numeric
    /// values into the sentinel type.
    pub fn data_type_for(&self, value: &PointValue, legacy: bool) -> &'static str {
        match (value, legacy) {
            (PointValue::Long(_) | PointValue::Double(_), true) => LEGACY_DATA_TYPE,
            (PointValue::Long(_), false) => "long",
            (PointValue::Double(_), false) => "double",
            (PointValue::Text(_), _) => "string",
        }
    }

    /// Encode a value for storage under the given data type. Returns the
    /// column bytes and the legacy offset type bit.
    pub fn encode(&self, data_type: &str, value: &PointValue) -> Result<(Vec<u8>, bool)> {
        if data_type == LEGACY_DATA_TYPE {
            encode_legacy(value)
        } else {
            Ok((self.get(data_type)?.encode(value)?, false))
        }
    }

    /// Decode column bytes for the given data type. `double_bit` is the
    /// column offset's reserved bit, only meaningful for legacy rows.
    pub fn decode(&self, data_type: &str, bytes: &[u8], double_bit: bool) -> Result<PointValue> {
        if data_type == LEGACY_DATA_TYPE {
            decode_legacy(bytes, double_bit)
        } else {
            self.get(data_type)?.decode(bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varlong_round_trip() {
        for v in [
            0i64,
            1,
            -1,
            127,
            128,
            -128,
            -129,
            255,
            65_535,
            i64::MAX,
            i64::MIN,
            1_700_000_000_123,
        ] {
            let bytes = encode_varlong(v);
            assert_eq!(decode_varlong(&bytes).unwrap(), v, "value {v}");
        }
    }

    #[test]
    fn test_varlong_is_minimal() {
        assert_eq!(encode_varlong(0).len(), 1);
        assert_eq!(encode_varlong(-1).len(), 1);
        assert_eq!(encode_varlong(127).len(), 1);
        assert_eq!(encode_varlong(128).len(), 2);
        assert_eq!(encode_varlong(-129).len(), 2);
        assert_eq!(encode_varlong(i64::MAX).len(), 8);
    }

    #[test]
    fn test_varlong_rejects_bad_lengths() {
        assert!(decode_varlong(&[]).is_err());
        assert!(decode_varlong(&[0; 9]).is_err());
    }

    #[test]
    fn test_legacy_round_trip() {
        let (bytes, bit) = encode_legacy(&PointValue::Long(-42)).unwrap();
        assert!(!bit);
        assert_eq!(decode_legacy(&bytes, bit).unwrap(), PointValue::Long(-42));

        let (bytes, bit) = encode_legacy(&PointValue::Double(3.25)).unwrap();
        assert!(bit);
        assert_eq!(
            decode_legacy(&bytes, bit).unwrap(),
            PointValue::Double(3.25)
        );
    }

    #[test]
    fn test_legacy_accepts_old_float_tag() {
        let mut bytes = vec![LEGACY_FLOAT_TAG];
        bytes.extend_from_slice(&2.5f32.to_be_bytes());
        assert_eq!(
            decode_legacy(&bytes, true).unwrap(),
            PointValue::Double(2.5)
        );
    }

    #[test]
    fn test_legacy_rejects_text() {
        assert!(encode_legacy(&PointValue::Text("x".into())).is_err());
    }

    #[test]
    fn test_registry_dispatch() {
        let registry = PointFactoryRegistry::default();

        let (bytes, bit) = registry.encode("long", &PointValue::Long(7)).unwrap();
        assert!(!bit);
        assert_eq!(
            registry.decode("long", &bytes, false).unwrap(),
            PointValue::Long(7)
        );

        let (bytes, _) = registry
            .encode("string", &PointValue::Text("hello".into()))
            .unwrap();
        assert_eq!(
            registry.decode("string", &bytes, false).unwrap(),
            PointValue::Text("hello".into())
        );

        assert!(matches!(
            registry.decode("geo_point", &[], false),
            Err(StratumError::UnknownDataType(_))
        ));
    }

    #[test]
    fn test_registry_data_type_for() {
        let registry = PointFactoryRegistry::default();
        assert_eq!(
            registry.data_type_for(&PointValue::Long(1), true),
            LEGACY_DATA_TYPE
        );
        assert_eq!(registry.data_type_for(&PointValue::Long(1), false), "long");
        assert_eq!(
            registry.data_type_for(&PointValue::Double(1.0), false),
            "double"
        );
        assert_eq!(
            registry.data_type_for(&PointValue::Text("x".into()), true),
            "string"
        );
    }
}

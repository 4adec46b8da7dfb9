use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::TagRead;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;
const PAYLOAD_MAGIC: &[u8; 4] = b"TAGQ";

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid magic bytes")]
    BadMagic,

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("payload too large: {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },
}

impl From<ciborium::de::Error<std::io::Error>> for PayloadError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        PayloadError::Decode(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for PayloadError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        PayloadError::Encode(e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct PayloadEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    body: Vec<u8>,
}

/// Wraps `event` in a CBOR envelope `{magic, schema_version, checksum, body}`
/// where `checksum` is the blake3 hash of the encoded body.
pub fn encode_event(event: &TagRead) -> Result<Vec<u8>, PayloadError> {
    let mut body = Vec::new();
    ciborium::into_writer(event, &mut body)?;

    let checksum = blake3::hash(&body);
    let envelope = PayloadEnvelope {
        magic: *PAYLOAD_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *checksum.as_bytes(),
        body,
    };

    let mut bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut bytes)?;

    if bytes.len() > MAX_PAYLOAD_BYTES {
        return Err(PayloadError::TooLarge {
            size: bytes.len(),
            max: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(bytes)
}

pub fn decode_event(bytes: &[u8]) -> Result<TagRead, PayloadError> {
    if bytes.len() > MAX_PAYLOAD_BYTES {
        return Err(PayloadError::TooLarge {
            size: bytes.len(),
            max: MAX_PAYLOAD_BYTES,
        });
    }

    let envelope: PayloadEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *PAYLOAD_MAGIC {
        return Err(PayloadError::BadMagic);
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(PayloadError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    let actual = blake3::hash(&envelope.body);
    if actual.as_bytes() != &envelope.checksum {
        return Err(PayloadError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual.as_bytes()),
        });
    }

    match envelope.schema_version {
        CURRENT_SCHEMA_VERSION => Ok(ciborium::from_reader(&envelope.body[..])?),
        other => Err(PayloadError::UnknownSchema(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UnixTimeMs;

    fn sample_read() -> TagRead {
        TagRead::new("E280689400004006A12BC123", -48, UnixTimeMs(1_700_000_000_000))
            .unwrap()
            .with_location("back-bar")
            .unwrap()
            .with_metadata("antenna", "2")
            .unwrap()
    }

    fn envelope_with(schema_version: u32, body: Vec<u8>, checksum: [u8; 32]) -> Vec<u8> {
        let envelope = PayloadEnvelope {
            magic: *PAYLOAD_MAGIC,
            schema_version,
            checksum,
            body,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();
        bytes
    }

    #[test]
    fn decodes_what_it_encodes() {
        let read = sample_read();
        let bytes = encode_event(&read).unwrap();
        assert_eq!(decode_event(&bytes).unwrap(), read);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            decode_event(b"definitely not cbor"),
            Err(PayloadError::Decode(_))
        ));
        assert!(decode_event(&[]).is_err());
    }

    #[test]
    fn flipped_body_byte_fails_checksum() {
        let read = sample_read();
        let mut body = Vec::new();
        ciborium::into_writer(&read, &mut body).unwrap();
        let checksum = *blake3::hash(&body).as_bytes();
        let last = body.len() - 1;
        body[last] ^= 0xFF;

        let bytes = envelope_with(CURRENT_SCHEMA_VERSION, body, checksum);
        assert!(matches!(
            decode_event(&bytes),
            Err(PayloadError::IntegrityCheckFailed { .. })
        ));
    }

    #[test]
    fn future_schema_is_rejected() {
        let bytes = envelope_with(CURRENT_SCHEMA_VERSION + 1, vec![], [0u8; 32]);
        assert!(matches!(
            decode_event(&bytes),
            Err(PayloadError::FutureSchema { found: 2, max: 1 })
        ));
    }

    #[test]
    fn unknown_older_schema_is_rejected() {
        let body = Vec::new();
        let checksum = *blake3::hash(&body).as_bytes();
        let bytes = envelope_with(0, body, checksum);
        assert!(matches!(
            decode_event(&bytes),
            Err(PayloadError::UnknownSchema(0))
        ));
    }

    #[test]
    fn body_with_unknown_fields_is_rejected() {
        #[derive(Serialize)]
        struct Extended {
            tag_id: String,
            rssi: i16,
            surprise: bool,
        }
        let mut body = Vec::new();
        ciborium::into_writer(
            &Extended {
                tag_id: "ABCD".into(),
                rssi: -40,
                surprise: true,
            },
            &mut body,
        )
        .unwrap();
        let checksum = *blake3::hash(&body).as_bytes();
        let bytes = envelope_with(CURRENT_SCHEMA_VERSION, body, checksum);
        assert!(matches!(decode_event(&bytes), Err(PayloadError::Decode(_))));
    }

    #[test]
    fn oversized_input_rejected() {
        let oversized = vec![0u8; MAX_PAYLOAD_BYTES + 1];
        assert!(matches!(
            decode_event(&oversized),
            Err(PayloadError::TooLarge { .. })
        ));
    }
}

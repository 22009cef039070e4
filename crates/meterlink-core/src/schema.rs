//! Typed decoding of positional reply lists.
//!
//! Replies are flat [`WireValue`] lists. Each layout here is an explicit
//! schema: fixed header slots, then (for meter readings) a count field and a
//! fixed-stride repeated group. Lengths are validated against the declared
//! count before any group slot is indexed, and a reply either decodes fully
//! or is rejected.

use thiserror::Error;

use crate::levels::{ChannelLevel, MeterLevels};
use crate::protocol::{ErrorCode, MeterId};
use crate::value::{ValueTag, WireValue};

/// A reply did not match the layout expected for its call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    /// The reply had no slots at all.
    #[error("Empty reply")]
    Empty,

    /// The reply was a single null slot (the engine sent nothing useful).
    #[error("Null reply")]
    NullReply,

    /// A required slot is missing.
    #[error("Missing slot {0}")]
    MissingSlot(usize),

    /// A slot carried a different type than the layout requires.
    #[error("Slot {slot}: expected {expected:?}, found {found:?}")]
    TypeMismatch {
        slot: usize,
        expected: ValueTag,
        found: ValueTag,
    },

    /// The channel count field was negative.
    #[error("Negative channel count: {0}")]
    NegativeCount(i32),

    /// The reply length does not match the declared channel count.
    #[error("Reply declares {channels} channels ({expected} slots) but has {actual} slots")]
    LengthMismatch {
        channels: usize,
        expected: usize,
        actual: usize,
    },
}

/// Status slot of a reply, plus the optional message that follows errors.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub code: ErrorCode,
    pub message: Option<String>,
}

fn slot(reply: &[WireValue], index: usize) -> Result<&WireValue, SchemaError> {
    reply.get(index).ok_or(SchemaError::MissingSlot(index))
}

fn mismatch(index: usize, expected: ValueTag, found: &WireValue) -> SchemaError {
    SchemaError::TypeMismatch {
        slot: index,
        expected,
        found: found.tag(),
    }
}

fn slot_u64(reply: &[WireValue], index: usize) -> Result<u64, SchemaError> {
    let v = slot(reply, index)?;
    v.as_u64().ok_or_else(|| mismatch(index, ValueTag::UInt64, v))
}

fn slot_u32(reply: &[WireValue], index: usize) -> Result<u32, SchemaError> {
    let v = slot(reply, index)?;
    v.as_u32().ok_or_else(|| mismatch(index, ValueTag::UInt32, v))
}

fn slot_i32(reply: &[WireValue], index: usize) -> Result<i32, SchemaError> {
    let v = slot(reply, index)?;
    v.as_i32().ok_or_else(|| mismatch(index, ValueTag::Int32, v))
}

fn slot_f32(reply: &[WireValue], index: usize) -> Result<f32, SchemaError> {
    let v = slot(reply, index)?;
    v.as_f32().ok_or_else(|| mismatch(index, ValueTag::Float32, v))
}

/// Read the status slot.
///
/// Empty replies and replies consisting of a single null are protocol
/// failures, not statuses.
pub fn read_status(reply: &[WireValue]) -> Result<Status, SchemaError> {
    match reply {
        [] => return Err(SchemaError::Empty),
        [WireValue::Null] => return Err(SchemaError::NullReply),
        _ => {}
    }
    let code = ErrorCode::from(slot_u64(reply, 0)?);
    let message = if code.is_ok() {
        None
    } else {
        reply.get(1).and_then(|v| v.as_str()).map(str::to_string)
    };
    Ok(Status { code, message })
}

/// Layout of a meter reading reply.
///
/// `[status, channels: Int32, (magnitude, peak, input_peak): Float32 × channels]`
pub struct LevelsSchema;

impl LevelsSchema {
    pub const STATUS_SLOT: usize = 0;
    pub const COUNT_SLOT: usize = 1;
    pub const FIRST_CHANNEL_SLOT: usize = 2;
    pub const STRIDE: usize = 3;

    /// Total reply length for a reading with `channels` channels.
    pub fn expected_len(channels: usize) -> usize {
        Self::FIRST_CHANNEL_SLOT + Self::STRIDE * channels
    }

    /// Build a well-formed `Ok` reply for the given levels.
    pub fn encode(levels: &MeterLevels) -> Vec<WireValue> {
        let mut reply = Vec::with_capacity(Self::expected_len(levels.channels()));
        reply.push(ErrorCode::Ok.into());
        reply.push(WireValue::Int32(levels.channels() as i32));
        for level in levels.iter() {
            reply.push(WireValue::Float32(level.magnitude));
            reply.push(WireValue::Float32(level.peak));
            reply.push(WireValue::Float32(level.input_peak));
        }
        reply
    }
}

/// Decode the channel data of an `Ok` meter reading reply.
///
/// The status slot is not interpreted here; callers branch on
/// [`read_status`] first.
pub fn decode_levels(reply: &[WireValue]) -> Result<MeterLevels, SchemaError> {
    let declared = slot_i32(reply, LevelsSchema::COUNT_SLOT)?;
    if declared < 0 {
        return Err(SchemaError::NegativeCount(declared));
    }
    let channels = declared as usize;
    let expected = LevelsSchema::expected_len(channels);
    if reply.len() != expected {
        return Err(SchemaError::LengthMismatch {
            channels,
            expected,
            actual: reply.len(),
        });
    }

    let mut levels = MeterLevels::with_channels(channels);
    for ch in 0..channels {
        let base = LevelsSchema::FIRST_CHANNEL_SLOT + ch * LevelsSchema::STRIDE;
        levels.set_channel(
            ch,
            ChannelLevel {
                magnitude: slot_f32(reply, base)?,
                peak: slot_f32(reply, base + 1)?,
                input_peak: slot_f32(reply, base + 2)?,
            },
        );
    }
    Ok(levels)
}

/// Fields of a successful `Create` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateReply {
    pub id: MeterId,
    pub interval_ms: u32,
}

/// `[status, id: UInt64, interval_ms: UInt32]`
pub fn decode_create_reply(reply: &[WireValue]) -> Result<CreateReply, SchemaError> {
    Ok(CreateReply {
        id: MeterId(slot_u64(reply, 1)?),
        interval_ms: slot_u32(reply, 2)?,
    })
}

/// `[status, interval_ms: UInt32]`
pub fn decode_interval_reply(reply: &[WireValue]) -> Result<u32, SchemaError> {
    slot_u32(reply, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(channels: &[(f32, f32, f32)]) -> Vec<WireValue> {
        let levels: MeterLevels = channels
            .iter()
            .map(|&(magnitude, peak, input_peak)| ChannelLevel {
                magnitude,
                peak,
                input_peak,
            })
            .collect();
        LevelsSchema::encode(&levels)
    }

    #[test]
    fn test_decodes_every_channel_count() {
        for n in 0..8usize {
            let triples: Vec<_> = (0..n)
                .map(|i| (i as f32, i as f32 + 0.5, i as f32 + 0.25))
                .collect();
            let reply = reading(&triples);
            assert_eq!(reply.len(), LevelsSchema::expected_len(n));

            let levels = decode_levels(&reply).unwrap();
            assert_eq!(levels.channels(), n);
            assert_eq!(levels.peak.len(), n);
            assert_eq!(levels.input_peak.len(), n);
            for (i, &(m, p, ip)) in triples.iter().enumerate() {
                assert_eq!(levels.channel(i).unwrap(), ChannelLevel {
                    magnitude: m,
                    peak: p,
                    input_peak: ip,
                });
            }
        }
    }

    #[test]
    fn test_truncated_reading_rejected() {
        let full = reading(&[(0.1, 0.2, 0.3), (0.4, 0.5, 0.6)]);
        for cut in 1..full.len() {
            let truncated = &full[..cut];
            assert!(decode_levels(truncated).is_err(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_count_checked_before_indexing() {
        let reply = vec![
            ErrorCode::Ok.into(),
            WireValue::Int32(1000),
            WireValue::Float32(0.0),
        ];
        assert_eq!(
            decode_levels(&reply),
            Err(SchemaError::LengthMismatch {
                channels: 1000,
                expected: 3002,
                actual: 3,
            })
        );
    }

    #[test]
    fn test_negative_count_rejected() {
        let reply = vec![ErrorCode::Ok.into(), WireValue::Int32(-1)];
        assert_eq!(decode_levels(&reply), Err(SchemaError::NegativeCount(-1)));
    }

    #[test]
    fn test_wrong_field_type_rejected() {
        let mut reply = reading(&[(0.1, 0.2, 0.3)]);
        reply[3] = WireValue::Float64(0.2);
        assert!(matches!(
            decode_levels(&reply),
            Err(SchemaError::TypeMismatch { slot: 3, .. })
        ));
    }

    #[test]
    fn test_status_reading() {
        assert_eq!(read_status(&[]), Err(SchemaError::Empty));
        assert_eq!(read_status(&[WireValue::Null]), Err(SchemaError::NullReply));

        let status = read_status(&[ErrorCode::Ok.into()]).unwrap();
        assert_eq!(status.code, ErrorCode::Ok);
        assert!(status.message.is_none());

        let status = read_status(&[
            ErrorCode::InvalidReference.into(),
            WireValue::from("source gone"),
        ])
        .unwrap();
        assert_eq!(status.code, ErrorCode::InvalidReference);
        assert_eq!(status.message.as_deref(), Some("source gone"));

        assert!(matches!(
            read_status(&[WireValue::Int32(0)]),
            Err(SchemaError::TypeMismatch { slot: 0, .. })
        ));
    }

    #[test]
    fn test_create_and_interval_replies() {
        let reply = vec![
            ErrorCode::Ok.into(),
            WireValue::UInt64(17),
            WireValue::UInt32(33),
        ];
        assert_eq!(
            decode_create_reply(&reply).unwrap(),
            CreateReply {
                id: MeterId(17),
                interval_ms: 33,
            }
        );
        assert_eq!(
            decode_create_reply(&reply[..2]),
            Err(SchemaError::MissingSlot(2))
        );

        let reply = vec![ErrorCode::Ok.into(), WireValue::UInt32(50)];
        assert_eq!(decode_interval_reply(&reply), Ok(50));
    }
}

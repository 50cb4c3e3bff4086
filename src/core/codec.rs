//! Packet codec for the DECG sensor
//! This module frames outbound control commands and decodes inbound sample records.
//!
//! Every control frame is delimited by `0xFA` / `0xFB`. Multi-byte fields are big-endian.
//!
//! | Command | Frame |
//! |---|---|
//! | start collection, timed | `FA 01 01 01 YY MM DD hh mm ss FB` |
//! | start collection | `FA 01 01 00 FB` |
//! | stop collection | `FA 01 00 00 FB` |
//! | start / stop transfer | `FA 02 01 FB` / `FA 02 00 FB` |
//!
//! Inbound notifications are a concatenation of 10-byte sample records: one status byte
//! followed by three 24-bit signed big-endian lead values.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// First byte of every control frame
pub const FRAME_START: u8 = 0xFA;
/// Last byte of every control frame
pub const FRAME_END: u8 = 0xFB;
/// Size of one inbound sample record in bytes
pub const SAMPLE_RECORD_LEN: usize = 10;

const OP_COLLECTION: u8 = 0x01;
const OP_TRANSFER: u8 = 0x02;
const TIME_LEN: usize = 6;
const SERIAL_LEN: usize = 6;
const RECORDING_HEADER_LEN: usize = SERIAL_LEN + TIME_LEN;

/// Errors produced while decoding device bytes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("sample group {group} has {len} bytes, expected 10")]
    InvalidRecordLength { group: usize, len: usize },
    #[error("frame does not start with 0xFA")]
    MissingStartMarker,
    #[error("frame does not end with 0xFB")]
    MissingEndMarker,
    #[error("unknown command opcode 0x{0:02X}")]
    UnknownCommand(u8),
    #[error("invalid flag 0x{value:02X} at offset {offset}")]
    InvalidFlag { offset: usize, value: u8 },
    #[error("expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("timestamp fields are out of range")]
    InvalidTimestamp,
}

/// Wall-clock start time sent with a timed start-collection command.
///
/// Only the last two digits of the year travel on the wire; decoding assumes the 2000s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl StartTime {
    pub fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            minute,
            second,
        }
    }

    pub fn from_datetime(datetime: &NaiveDateTime) -> Self {
        Self {
            year: datetime.year().clamp(0, u16::MAX as i32) as u16,
            month: datetime.month() as u8,
            day: datetime.day() as u8,
            hour: datetime.hour() as u8,
            minute: datetime.minute() as u8,
            second: datetime.second() as u8,
        }
    }

    /// The current local time, as the device clock expects it
    pub fn now_local() -> Self {
        Self::from_datetime(&chrono::Local::now().naive_local())
    }

    /// Returns `None` when the fields do not form a real calendar time
    pub fn to_datetime(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year as i32, self.month as u32, self.day as u32)?.and_hms_opt(
            self.hour as u32,
            self.minute as u32,
            self.second as u32,
        )
    }

    fn to_bytes(self) -> [u8; TIME_LEN] {
        [
            (self.year % 100) as u8,
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second,
        ]
    }

    fn from_bytes(bytes: &[u8; TIME_LEN]) -> Result<Self, DecodeError> {
        let time = Self::new(
            2000 + bytes[0] as u16,
            bytes[1],
            bytes[2],
            bytes[3],
            bytes[4],
            bytes[5],
        );
        match time.to_datetime() {
            Some(_) => Ok(time),
            None => Err(DecodeError::InvalidTimestamp),
        }
    }
}

/// How a collection is started: with or without a device-clock timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionStart {
    Untimed,
    At(StartTime),
}

/// Outbound control commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Start collection; the device wipes its previous recording
    StartCollection(CollectionStart),
    /// Stop collection
    StopCollection,
    /// Start streaming samples over the data characteristic
    StartTransfer,
    /// Stop streaming; collection to device storage continues
    StopTransfer,
}

impl ControlCommand {
    /// Convert the command to its framed byte representation
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(5 + TIME_LEN);
        frame.push(FRAME_START);
        match self {
            Self::StartCollection(CollectionStart::Untimed) => {
                frame.extend_from_slice(&[OP_COLLECTION, 0x01, 0x00]);
            }
            Self::StartCollection(CollectionStart::At(time)) => {
                frame.extend_from_slice(&[OP_COLLECTION, 0x01, 0x01]);
                frame.extend_from_slice(&time.to_bytes());
            }
            Self::StopCollection => frame.extend_from_slice(&[OP_COLLECTION, 0x00, 0x00]),
            Self::StartTransfer => frame.extend_from_slice(&[OP_TRANSFER, 0x01]),
            Self::StopTransfer => frame.extend_from_slice(&[OP_TRANSFER, 0x00]),
        }
        frame.push(FRAME_END);
        frame
    }
}

fn decode_flag(frame: &[u8], offset: usize) -> Result<bool, DecodeError> {
    match frame[offset] {
        0x00 => Ok(false),
        0x01 => Ok(true),
        value => Err(DecodeError::InvalidFlag { offset, value }),
    }
}

fn expect_len(frame: &[u8], expected: usize) -> Result<(), DecodeError> {
    if frame.len() == expected {
        Ok(())
    } else {
        Err(DecodeError::InvalidLength {
            expected,
            actual: frame.len(),
        })
    }
}

/// Parses a control frame back into the command that produced it.
///
/// The device never sends these frames; this inverse exists so framing can be verified.
pub fn decode_frame_header(frame: &[u8]) -> Result<ControlCommand, DecodeError> {
    if frame.len() < 4 {
        return Err(DecodeError::InvalidLength {
            expected: 4,
            actual: frame.len(),
        });
    }
    if frame[0] != FRAME_START {
        return Err(DecodeError::MissingStartMarker);
    }
    if frame[frame.len() - 1] != FRAME_END {
        return Err(DecodeError::MissingEndMarker);
    }

    match frame[1] {
        OP_COLLECTION => {
            if frame.len() < 5 {
                return Err(DecodeError::InvalidLength {
                    expected: 5,
                    actual: frame.len(),
                });
            }
            let start = decode_flag(frame, 2)?;
            let timed = decode_flag(frame, 3)?;
            match (start, timed) {
                (false, false) => {
                    expect_len(frame, 5)?;
                    Ok(ControlCommand::StopCollection)
                }
                (false, true) => Err(DecodeError::InvalidFlag {
                    offset: 3,
                    value: frame[3],
                }),
                (true, false) => {
                    expect_len(frame, 5)?;
                    Ok(ControlCommand::StartCollection(CollectionStart::Untimed))
                }
                (true, true) => {
                    expect_len(frame, 5 + TIME_LEN)?;
                    let mut time = [0u8; TIME_LEN];
                    time.copy_from_slice(&frame[4..4 + TIME_LEN]);
                    Ok(ControlCommand::StartCollection(CollectionStart::At(
                        StartTime::from_bytes(&time)?,
                    )))
                }
            }
        }
        OP_TRANSFER => {
            expect_len(frame, 4)?;
            if decode_flag(frame, 2)? {
                Ok(ControlCommand::StartTransfer)
            } else {
                Ok(ControlCommand::StopTransfer)
            }
        }
        opcode => Err(DecodeError::UnknownCommand(opcode)),
    }
}

/// One three-lead sample record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcgSample {
    pub status_flags: u8,
    pub ecg1: i32,
    pub ecg2: i32,
    pub ecg3: i32,
}

impl EcgSample {
    pub fn from_record(record: &[u8; SAMPLE_RECORD_LEN]) -> Self {
        Self {
            status_flags: record[0],
            ecg1: sign_extend_24(record[1], record[2], record[3]),
            ecg2: sign_extend_24(record[4], record[5], record[6]),
            ecg3: sign_extend_24(record[7], record[8], record[9]),
        }
    }
}

/// Big-endian 24-bit two's complement to i32
fn sign_extend_24(high: u8, mid: u8, low: u8) -> i32 {
    let raw = ((high as i32) << 16) | ((mid as i32) << 8) | low as i32;
    if raw & 0x80_0000 != 0 {
        raw - (1 << 24)
    } else {
        raw
    }
}

/// Result of decoding one notification payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedBatch {
    /// Samples from every well-formed group, in payload order
    pub samples: Vec<EcgSample>,
    /// One entry per rejected group
    pub errors: Vec<DecodeError>,
}

impl DecodedBatch {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Splits a notification payload into 10-byte groups and decodes each one independently.
///
/// A short trailing group is reported in `errors` and never affects its neighbours.
pub fn decode_samples(payload: &[u8]) -> DecodedBatch {
    let mut batch = DecodedBatch {
        samples: Vec::with_capacity(payload.len() / SAMPLE_RECORD_LEN),
        errors: Vec::new(),
    };

    for (group, chunk) in payload.chunks(SAMPLE_RECORD_LEN).enumerate() {
        match <&[u8; SAMPLE_RECORD_LEN]>::try_from(chunk) {
            Ok(record) => batch.samples.push(EcgSample::from_record(record)),
            Err(_) => batch.errors.push(DecodeError::InvalidRecordLength {
                group,
                len: chunk.len(),
            }),
        }
    }

    batch
}

/// Header of an `ECG.BIN` recording pulled from device storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingHeader {
    /// Device serial number as 12 upper-case hex digits
    pub serial: String,
    pub started_at: NaiveDateTime,
}

/// Decodes the serial number and start time at the head of a recording file.
///
/// Layout: bytes 0-5 serial, bytes 6-11 `YY MM DD hh mm ss`. Anything after byte 11 is ignored.
pub fn decode_recording_header(bytes: &[u8]) -> Result<RecordingHeader, DecodeError> {
    if bytes.len() < RECORDING_HEADER_LEN {
        return Err(DecodeError::InvalidLength {
            expected: RECORDING_HEADER_LEN,
            actual: bytes.len(),
        });
    }

    let serial = bytes[..SERIAL_LEN]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<String>();

    let mut time = [0u8; TIME_LEN];
    time.copy_from_slice(&bytes[SERIAL_LEN..RECORDING_HEADER_LEN]);
    let started_at = StartTime::from_bytes(&time)?
        .to_datetime()
        .ok_or(DecodeError::InvalidTimestamp)?;

    Ok(RecordingHeader { serial, started_at })
}

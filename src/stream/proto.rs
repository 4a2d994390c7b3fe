use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stream::frame::RawFrame;

/// One decoded real-time measurement sample.
///
/// `hr` is carried as text, not parsed as a number; that is the OCP
/// contract for the field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp: String,
    pub vo2: f64,
    pub vco2: f64,
    pub phase: String,
    pub ve: f64,
    pub hr: String,
}

/// Per-frame decode failures. All variants are recoverable: the session
/// reports them as warnings and continues with the next frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The document carries no `SetRealTimeInfo` element anywhere in its
    /// tree, e.g. an acknowledgement echo or another OCP message type.
    #[error("message contains no SetRealTimeInfo element")]
    UnrecognizedMessage,

    /// A required field is missing, or a numeric field failed to parse.
    #[error("missing or malformed field: {0}")]
    MalformedField(&'static str),

    /// The document is structurally balanced but not parseable XML.
    #[error("xml parse error: {0}")]
    Xml(#[from] quick_xml::Error),
}

/// Builds the `EnableRealTimeInformation` command document with the given
/// flag value. Pure; socket logic stays in the session so future command
/// types compose the same way.
pub fn set_real_time_info_command(enabled: bool) -> Vec<u8> {
    let flag = if enabled { '1' } else { '0' };
    format!(
        "<OmniaXB><System><EnableRealTimeInformation><Enabled>{flag}</Enabled>\
         </EnableRealTimeInformation></System></OmniaXB>"
    )
    .into_bytes()
}

/// Builds the handshake command that enables the real-time telemetry push.
pub fn enable_real_time_command() -> Vec<u8> {
    set_real_time_info_command(true)
}

/// Decodes one complete XML document into a telemetry record.
///
/// The first `SetRealTimeInfo` element is located at any depth; the device
/// nests it under varying ancestor elements. Its direct child text fields
/// `TimeStamp`, `VO2`, `VCO2`, `PHASE`, `VE`, `HR` are extracted; the three
/// volume/flow fields parse as floats and round to one decimal place.
pub fn decode_telemetry(frame: &RawFrame) -> Result<TelemetryRecord, DecodeError> {
    let mut reader = Reader::from_reader(frame.as_bytes());
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(start) if start.local_name().as_ref() == b"SetRealTimeInfo" => break,
            Event::Empty(empty) if empty.local_name().as_ref() == b"SetRealTimeInfo" => {
                // Present but childless.
                return Err(DecodeError::MalformedField("TimeStamp"));
            }
            Event::Eof => return Err(DecodeError::UnrecognizedMessage),
            _ => {}
        }
        buf.clear();
    }
    buf.clear();

    let mut fields = RawFields::default();
    let mut current: Option<&'static str> = None;
    let mut depth = 0usize;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(start) => {
                if depth == 0 {
                    current = field_name(start.local_name().as_ref());
                }
                depth += 1;
            }
            Event::Empty(_) => {}
            Event::Text(text) => {
                if depth == 1 {
                    if let Some(field) = current {
                        fields.set(field, text.unescape()?.into_owned());
                    }
                }
            }
            Event::End(_) => {
                if depth == 0 {
                    // End of SetRealTimeInfo itself.
                    break;
                }
                depth -= 1;
                if depth == 0 {
                    current = None;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    fields.into_record()
}

fn field_name(name: &[u8]) -> Option<&'static str> {
    match name {
        b"TimeStamp" => Some("TimeStamp"),
        b"VO2" => Some("VO2"),
        b"VCO2" => Some("VCO2"),
        b"PHASE" => Some("PHASE"),
        b"VE" => Some("VE"),
        b"HR" => Some("HR"),
        _ => None,
    }
}

#[derive(Default)]
struct RawFields {
    time_stamp: Option<String>,
    vo2: Option<String>,
    vco2: Option<String>,
    phase: Option<String>,
    ve: Option<String>,
    hr: Option<String>,
}

impl RawFields {
    fn set(&mut self, field: &str, value: String) {
        match field {
            "TimeStamp" => self.time_stamp = Some(value),
            "VO2" => self.vo2 = Some(value),
            "VCO2" => self.vco2 = Some(value),
            "PHASE" => self.phase = Some(value),
            "VE" => self.ve = Some(value),
            "HR" => self.hr = Some(value),
            _ => {}
        }
    }

    fn into_record(self) -> Result<TelemetryRecord, DecodeError> {
        Ok(TelemetryRecord {
            timestamp: self
                .time_stamp
                .ok_or(DecodeError::MalformedField("TimeStamp"))?,
            vo2: parse_rounded(self.vo2, "VO2")?,
            vco2: parse_rounded(self.vco2, "VCO2")?,
            phase: self.phase.ok_or(DecodeError::MalformedField("PHASE"))?,
            ve: parse_rounded(self.ve, "VE")?,
            hr: self.hr.ok_or(DecodeError::MalformedField("HR"))?,
        })
    }
}

fn parse_rounded(value: Option<String>, field: &'static str) -> Result<f64, DecodeError> {
    let text = value.ok_or(DecodeError::MalformedField(field))?;
    let parsed: f64 = text
        .trim()
        .parse()
        .map_err(|_| DecodeError::MalformedField(field))?;
    Ok(round_to_tenth(parsed))
}

fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

//! Line codec of the relay link.
//!
//! One JSON object per line:
//!
//! ```text
//! {"type":"com","act":"push","pow":0.61,"ts":1718000000.125}
//! {"act":"KILLSWITCH"}
//! ```
//!
//! Any record whose `act` is `"KILLSWITCH"` is a killswitch, whatever else it
//! carries. `ts` (Unix seconds) is optional when decoding; the receipt time
//! is used when it is missing or unusable.

use chrono::{DateTime, Utc};
use neogrip_types::{CommandEvent, KILLSWITCH_ACT, NeoError, RelayMessage};
use serde::Serialize;
use serde_json::Value;

const COMMAND_TYPE: &str = "com";

#[derive(Serialize)]
struct CommandRecord<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    act: &'a str,
    pow: f64,
    ts: f64,
}

#[derive(Serialize)]
struct KillswitchRecord {
    act: &'static str,
}

/// Serialise `msg` as one newline-terminated line.
pub fn encode_line(msg: &RelayMessage) -> Result<String, NeoError> {
    let mut line = match msg {
        RelayMessage::Command(ev) => serde_json::to_string(&CommandRecord {
            kind: COMMAND_TYPE,
            act: &ev.act,
            pow: ev.pow,
            ts: ev.timestamp.timestamp_micros() as f64 / 1_000_000.0,
        }),
        RelayMessage::Killswitch => serde_json::to_string(&KillswitchRecord {
            act: KILLSWITCH_ACT,
        }),
    }?;
    line.push('\n');
    Ok(line)
}

/// Parse one line (with or without its trailing newline).
///
/// # Errors
///
/// [`NeoError::MalformedRecord`] for anything that is neither a killswitch
/// nor a complete command record with `pow` in `[0, 1]`.
pub fn decode_line(line: &str) -> Result<RelayMessage, NeoError> {
    let value: Value = serde_json::from_str(line.trim())
        .map_err(|e| NeoError::MalformedRecord(format!("not JSON: {e}")))?;
    let Some(obj) = value.as_object() else {
        return Err(NeoError::MalformedRecord(
            "record is not a JSON object".to_string(),
        ));
    };

    if obj.get("act").and_then(Value::as_str) == Some(KILLSWITCH_ACT) {
        return Ok(RelayMessage::Killswitch);
    }

    match obj.get("type").and_then(Value::as_str) {
        Some(COMMAND_TYPE) => {}
        other => {
            return Err(NeoError::MalformedRecord(format!(
                "unexpected record type {other:?}"
            )));
        }
    }
    let act = obj
        .get("act")
        .and_then(Value::as_str)
        .ok_or_else(|| NeoError::MalformedRecord("missing string field 'act'".to_string()))?;
    let pow = obj
        .get("pow")
        .and_then(Value::as_f64)
        .ok_or_else(|| NeoError::MalformedRecord("missing numeric field 'pow'".to_string()))?;
    if !(0.0..=1.0).contains(&pow) {
        return Err(NeoError::MalformedRecord(format!(
            "pow {pow} outside [0, 1]"
        )));
    }
    let timestamp = obj
        .get("ts")
        .and_then(Value::as_f64)
        .and_then(unix_seconds)
        .unwrap_or_else(Utc::now);

    Ok(RelayMessage::Command(CommandEvent::at(act, pow, timestamp)))
}

fn unix_seconds(ts: f64) -> Option<DateTime<Utc>> {
    if !ts.is_finite() {
        return None;
    }
    DateTime::from_timestamp_micros((ts * 1_000_000.0).round() as i64)
}

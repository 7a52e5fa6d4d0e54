//! Decoding of inbound Coinbase feed frames and encoding of the subscribe frame.
//!
//! Inbound frames of interest:
//! - `ticker`: `product_id`, `best_bid`, `best_ask`, `time`
//! - `match`: `product_id`, `trade_id`, `price`, `size`, `side`, `time`
//! - `error`: passed through as-is
//!
//! Everything else (`subscriptions` acknowledgements, heartbeats, ...) is ignored.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::model::{PriceTick, TradeEvent, TradeSide};
use crate::errors::RelayError;

const TICKER: &str = "ticker";
const MATCH: &str = "match";

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Price(PriceTick),
    Trade(TradeEvent),
    UpstreamError(Value),
    Ignored,
}

/// Why a frame was dropped.
#[derive(Debug)]
pub enum FrameError {
    /// Not JSON at all.
    Parse(serde_json::Error),
    /// A recognized frame with a missing or malformed required field.
    Validation(RelayError),
}

pub fn decode_frame(text: &str) -> Result<Frame, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(FrameError::Parse)?;
    let Some(fields) = value.as_object() else {
        return Ok(Frame::Ignored);
    };

    match fields.get("type").and_then(Value::as_str) {
        Some(TICKER) => decode_ticker(fields).map(Frame::Price),
        Some(MATCH) => decode_match(fields).map(Frame::Trade),
        Some("error") => Ok(Frame::UpstreamError(Value::Object(fields.clone()))),
        _ => Ok(Frame::Ignored),
    }
    .map_err(FrameError::Validation)
}

fn decode_ticker(fields: &Map<String, Value>) -> Result<PriceTick, RelayError> {
    Ok(PriceTick {
        bid: number(fields, TICKER, "best_bid")?,
        ask: number(fields, TICKER, "best_ask")?,
        timestamp: time(fields, TICKER)?,
        product_id: text(fields, TICKER, "product_id")?.to_string(),
    })
}

fn decode_match(fields: &Map<String, Value>) -> Result<TradeEvent, RelayError> {
    let trade_id = match required(fields, MATCH, "trade_id")? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => return Err(malformed(MATCH, "trade_id", other)),
    };
    let price = number(fields, MATCH, "price")?;
    let size = number(fields, MATCH, "size")?;
    let side = match text(fields, MATCH, "side")? {
        "buy" => TradeSide::Buy,
        "sell" => TradeSide::Sell,
        other => {
            return Err(RelayError::MalformedField {
                frame: MATCH,
                field: "side",
                value: other.to_string(),
            })
        }
    };

    Ok(TradeEvent {
        trade_id,
        price,
        size,
        side,
        timestamp: time(fields, MATCH)?,
        product_id: text(fields, MATCH, "product_id")?.to_string(),
    })
}

/// Present, non-null and not an empty string.
fn required<'a>(
    fields: &'a Map<String, Value>,
    frame: &'static str,
    field: &'static str,
) -> Result<&'a Value, RelayError> {
    match fields.get(field) {
        None | Some(Value::Null) => Err(RelayError::MissingField { frame, field }),
        Some(Value::String(s)) if s.is_empty() => Err(RelayError::MissingField { frame, field }),
        Some(v) => Ok(v),
    }
}

fn text<'a>(
    fields: &'a Map<String, Value>,
    frame: &'static str,
    field: &'static str,
) -> Result<&'a str, RelayError> {
    let value = required(fields, frame, field)?;
    value.as_str().ok_or_else(|| malformed(frame, field, value))
}

/// The feed sends decimals as text; plain JSON numbers are accepted too.
fn number(
    fields: &Map<String, Value>,
    frame: &'static str,
    field: &'static str,
) -> Result<f64, RelayError> {
    let value = required(fields, frame, field)?;
    let parsed = match value {
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    };
    parsed
        .filter(|n| n.is_finite())
        .ok_or_else(|| malformed(frame, field, value))
}

fn time(fields: &Map<String, Value>, frame: &'static str) -> Result<DateTime<Utc>, RelayError> {
    let raw = text(fields, frame, "time")?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| RelayError::MalformedField {
            frame,
            field: "time",
            value: raw.to_string(),
        })
}

fn malformed(frame: &'static str, field: &'static str, value: &Value) -> RelayError {
    RelayError::MalformedField {
        frame,
        field,
        value: value.to_string(),
    }
}

#[derive(Serialize)]
struct SubscribeFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    product_ids: Vec<&'a str>,
    channels: &'a [String],
}

/// Level-based subscribe frame: always the complete desired product set.
pub fn subscribe_frame<'a, I>(products: I, channels: &[String]) -> serde_json::Result<String>
where
    I: IntoIterator<Item = &'a String>,
{
    serde_json::to_string(&SubscribeFrame {
        kind: "subscribe",
        product_ids: products.into_iter().map(String::as_str).collect(),
        channels,
    })
}

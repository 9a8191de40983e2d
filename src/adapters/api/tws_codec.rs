//! TWS Socket Codec - IB Gateway Wire Format
//!
//! The gateway speaks a length-prefixed protocol: every message is a
//! 4-byte big-endian length followed by NUL-terminated text fields. The
//! handshake is the literal `API\0` followed by one such message
//! carrying the supported version range.
//!
//! Outgoing layouts are those of server version 151, the highest this
//! client advertises. The gateway answers with the lower of its own
//! maximum and ours, so a current gateway always settles on 151.

use std::str::FromStr;

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::ports::quote_session::Instrument;

/// Lowest server version accepted.
pub const MIN_VERSION: i32 = 151;
/// Highest server version advertised.
pub const MAX_VERSION: i32 = 151;

/// Upper bound on a single inbound message.
const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Outgoing message ids.
mod out {
  pub const REQ_MKT_DATA: i32 = 1;
  pub const CANCEL_MKT_DATA: i32 = 2;
  pub const REQ_CONTRACT_DATA: i32 = 9;
  pub const REQ_MARKET_DATA_TYPE: i32 = 59;
  pub const START_API: i32 = 71;
}

/// Incoming message ids.
mod inc {
  pub const TICK_PRICE: i32 = 1;
  pub const ERR_MSG: i32 = 4;
  pub const NEXT_VALID_ID: i32 = 9;
  pub const CONTRACT_DATA: i32 = 10;
  pub const CONTRACT_DATA_END: i32 = 52;
  pub const MARKET_DATA_TYPE: i32 = 58;
}

/// Tick types carrying a bid or ask, live and delayed.
const TICK_BID: i32 = 1;
const TICK_ASK: i32 = 2;
const TICK_DELAYED_BID: i32 = 66;
const TICK_DELAYED_ASK: i32 = 67;

/// Wire-level decoding errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TwsError {
  #[error("empty message")]
  Empty,
  #[error("message {msg_id} is missing field {index}")]
  MissingField { msg_id: i32, index: usize },
  #[error("field {index} is not a number: {value:?}")]
  InvalidNumber { index: usize, value: String },
  #[error("gateway server version {0} is not supported (need >= {MIN_VERSION})")]
  UnsupportedVersion(i32),
}

/// Which side of the book a price tick updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
  Bid,
  Ask,
}

/// Market data flavour requested with `reqMarketDataType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketDataType {
  Live = 1,
  Frozen = 2,
  Delayed = 3,
  DelayedFrozen = 4,
}

impl MarketDataType {
  /// Map the numeric code used in config.
  pub const fn from_code(code: u8) -> Option<Self> {
    match code {
      1 => Some(Self::Live),
      2 => Some(Self::Frozen),
      3 => Some(Self::Delayed),
      4 => Some(Self::DelayedFrozen),
      _ => None,
    }
  }
}

/// A decoded inbound message. Anything not needed for quoting is `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
  TickPrice { req_id: i32, side: Side, price: Decimal },
  Error { req_id: i32, code: i32, message: String },
  NextValidId(i64),
  ContractData { req_id: i32, conid: i64 },
  ContractDataEnd { req_id: i32 },
  MarketDataType { req_id: i32, data_type: i32 },
  Other(i32),
}

impl Incoming {
  /// Decode one message from its fields.
  ///
  /// # Errors
  /// `TwsError` when a field the message needs is missing or malformed.
  pub fn decode(fields: &[String]) -> Result<Self, TwsError> {
    let msg_id = parse_int(fields, 0, 0)?;
    let int = |index| parse_int(fields, msg_id, index);

    match msg_id {
      // [id, version, reqId, tickType, price, size, attrMask]
      inc::TICK_PRICE => {
        let tick_type = int(3)?;
        let side = match tick_type {
          TICK_BID | TICK_DELAYED_BID => Side::Bid,
          TICK_ASK | TICK_DELAYED_ASK => Side::Ask,
          _ => return Ok(Self::Other(msg_id)),
        };
        Ok(Self::TickPrice {
          req_id: int(2)?,
          side,
          price: parse_decimal(fields, msg_id, 4)?,
        })
      }
      // [id, version, reqId, code, message]
      inc::ERR_MSG => Ok(Self::Error {
        req_id: int(2)?,
        code: int(3)?,
        message: field(fields, msg_id, 4)?.to_string(),
      }),
      // [id, version, orderId]
      inc::NEXT_VALID_ID => Ok(Self::NextValidId(parse_i64(fields, msg_id, 2)?)),
      // [id, version, reqId, symbol, secType, lastTradeDate, strike, right,
      //  exchange, currency, localSymbol, marketName, tradingClass, conId, ...]
      inc::CONTRACT_DATA => Ok(Self::ContractData {
        req_id: int(2)?,
        conid: parse_i64(fields, msg_id, 13)?,
      }),
      // [id, version, reqId]
      inc::CONTRACT_DATA_END => Ok(Self::ContractDataEnd { req_id: int(2)? }),
      // [id, version, reqId, type]
      inc::MARKET_DATA_TYPE => Ok(Self::MarketDataType {
        req_id: int(2)?,
        data_type: int(3)?,
      }),
      other => Ok(Self::Other(other)),
    }
  }
}

fn field(fields: &[String], msg_id: i32, index: usize) -> Result<&str, TwsError> {
  fields
    .get(index)
    .map(String::as_str)
    .ok_or(TwsError::MissingField { msg_id, index })
}

fn parse_int(fields: &[String], msg_id: i32, index: usize) -> Result<i32, TwsError> {
  let raw = fields.get(index).ok_or(if index == 0 {
    TwsError::Empty
  } else {
    TwsError::MissingField { msg_id, index }
  })?;
  raw.trim().parse().map_err(|_| TwsError::InvalidNumber {
    index,
    value: raw.clone(),
  })
}

fn parse_i64(fields: &[String], msg_id: i32, index: usize) -> Result<i64, TwsError> {
  let raw = field(fields, msg_id, index)?;
  raw.trim().parse().map_err(|_| TwsError::InvalidNumber {
    index,
    value: raw.to_string(),
  })
}

fn parse_decimal(fields: &[String], msg_id: i32, index: usize) -> Result<Decimal, TwsError> {
  let raw = field(fields, msg_id, index)?.trim();
  Decimal::from_str(raw)
    .or_else(|_| Decimal::from_scientific(raw))
    .map_err(|_| TwsError::InvalidNumber {
      index,
      value: raw.to_string(),
    })
}

/// Frame `fields` as one length-prefixed message.
pub fn encode<S: AsRef<str>>(fields: &[S]) -> Vec<u8> {
  let mut body = Vec::new();
  for f in fields {
    body.extend_from_slice(f.as_ref().as_bytes());
    body.push(0);
  }
  let mut framed = Vec::with_capacity(body.len() + 4);
  // Messages are tiny; a u32 length always fits.
  framed.extend_from_slice(&u32::try_from(body.len()).unwrap_or(u32::MAX).to_be_bytes());
  framed.extend_from_slice(&body);
  framed
}

/// Read one length-prefixed message and split it into fields.
///
/// # Errors
/// I/O errors from the reader, or `InvalidData` for an oversized message.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<String>> {
  let len = reader.read_u32().await? as usize;
  if len > MAX_MESSAGE_LEN {
    return Err(std::io::Error::new(
      std::io::ErrorKind::InvalidData,
      format!("message of {len} bytes exceeds limit"),
    ));
  }
  let mut body = vec![0u8; len];
  reader.read_exact(&mut body).await?;

  let mut fields: Vec<String> = body
    .split(|b| *b == 0)
    .map(|f| String::from_utf8_lossy(f).into_owned())
    .collect();
  // Every field is NUL-terminated, so the split leaves one empty tail.
  if fields.last().is_some_and(String::is_empty) {
    fields.pop();
  }
  Ok(fields)
}

/// Connection prefix plus supported version range.
pub fn handshake() -> Vec<u8> {
  let mut bytes = b"API\0".to_vec();
  bytes.extend(encode(&[format!("v{MIN_VERSION}..{MAX_VERSION}")]));
  bytes
}

/// Server version from the handshake reply `[version, connectionTime]`.
///
/// # Errors
/// `TwsError` if the reply is malformed or the version too old.
pub fn server_version(reply: &[String]) -> Result<i32, TwsError> {
  let version = parse_int(reply, 0, 0)?;
  if version < MIN_VERSION {
    return Err(TwsError::UnsupportedVersion(version));
  }
  Ok(version)
}

pub fn start_api(client_id: i32) -> Vec<u8> {
  encode(&[
    out::START_API.to_string(),
    "2".into(),
    client_id.to_string(),
    String::new(),
  ])
}

pub fn market_data_type(data_type: MarketDataType) -> Vec<u8> {
  encode(&[
    out::REQ_MARKET_DATA_TYPE.to_string(),
    "1".into(),
    (data_type as i32).to_string(),
  ])
}

/// Contract fields shared by contract lookups and market data requests:
/// `conId, symbol, secType, lastTradeDate, strike, right, multiplier,
/// exchange, primaryExchange, currency, localSymbol, tradingClass`.
fn contract_fields(conid: i64, instrument: &Instrument) -> Vec<String> {
  vec![
    conid.to_string(),
    instrument.symbol.clone(),
    instrument.sec_type.clone(),
    String::new(),
    "0.0".into(),
    String::new(),
    String::new(),
    instrument.exchange.clone(),
    String::new(),
    instrument.currency.clone(),
    String::new(),
    String::new(),
  ]
}

pub fn contract_details(req_id: i32, instrument: &Instrument) -> Vec<u8> {
  let mut fields = vec![out::REQ_CONTRACT_DATA.to_string(), "8".into(), req_id.to_string()];
  fields.extend(contract_fields(instrument.conid.unwrap_or(0), instrument));
  // includeExpired, secIdType, secId
  fields.extend(["0".to_string(), String::new(), String::new()]);
  encode(&fields)
}

pub fn market_data(req_id: i32, conid: i64, instrument: &Instrument) -> Vec<u8> {
  let mut fields = vec![out::REQ_MKT_DATA.to_string(), "11".into(), req_id.to_string()];
  fields.extend(contract_fields(conid, instrument));
  // deltaNeutral, genericTickList, snapshot, regulatorySnapshot, options
  fields.extend([
    "0".to_string(),
    String::new(),
    "0".into(),
    "0".into(),
    String::new(),
  ]);
  encode(&fields)
}

pub fn cancel_market_data(req_id: i32) -> Vec<u8> {
  encode(&[out::CANCEL_MKT_DATA.to_string(), "2".into(), req_id.to_string()])
}

/// Error codes that are status notices rather than failures
/// (farm connection messages, delayed-data notices).
pub fn is_notice(code: i32) -> bool {
  (2100..2200).contains(&code) || code == 10167
}

/// Codes meaning the gateway lost its upstream connection.
pub const fn is_connectivity_lost(code: i32) -> bool {
  matches!(code, 504 | 1100 | 2110)
}

#[cfg(test)]
mod tests {
  use rust_decimal_macros::dec;

  use super::*;

  fn strings(fields: &[&str]) -> Vec<String> {
    fields.iter().map(ToString::to_string).collect()
  }

  fn fx() -> Instrument {
    Instrument {
      symbol: "USD".into(),
      sec_type: "CASH".into(),
      exchange: "IDEALPRO".into(),
      currency: "ZAR".into(),
      conid: None,
    }
  }

  #[test]
  fn test_encode_is_length_prefixed_and_nul_terminated() {
    let bytes = encode(&["59", "1", "3"]);
    assert_eq!(&bytes[..4], &[0, 0, 0, 7]);
    assert_eq!(&bytes[4..], b"59\x001\x003\x00");
  }

  #[test]
  fn test_handshake_advertises_version_range() {
    let bytes = handshake();
    assert_eq!(&bytes[..4], b"API\0");
    assert_eq!(&bytes[8..], b"v151..151\x00");
  }

  #[tokio::test]
  async fn test_read_message_splits_fields() {
    let bytes = encode(&["9", "1", "42"]);
    let mut reader = bytes.as_slice();
    let fields = read_message(&mut reader).await.unwrap();
    assert_eq!(fields, strings(&["9", "1", "42"]));
  }

  #[tokio::test]
  async fn test_read_message_keeps_empty_fields() {
    let bytes = encode(&["4", "2", "-1", "2104", ""]);
    let mut reader = bytes.as_slice();
    let fields = read_message(&mut reader).await.unwrap();
    assert_eq!(fields, strings(&["4", "2", "-1", "2104", ""]));
    assert!(matches!(
      Incoming::decode(&fields),
      Ok(Incoming::Error { code: 2104, .. })
    ));
  }

  #[test]
  fn test_decode_delayed_ticks() {
    let bid = Incoming::decode(&strings(&["1", "6", "7", "66", "17.1000", "100", "0"])).unwrap();
    let ask = Incoming::decode(&strings(&["1", "6", "7", "2", "-17.12", "100", "0"])).unwrap();
    assert_eq!(
      bid,
      Incoming::TickPrice {
        req_id: 7,
        side: Side::Bid,
        price: dec!(17.1000)
      }
    );
    assert_eq!(
      ask,
      Incoming::TickPrice {
        req_id: 7,
        side: Side::Ask,
        price: dec!(-17.12)
      }
    );
  }

  #[test]
  fn test_decode_ignores_other_tick_types() {
    let last = Incoming::decode(&strings(&["1", "6", "7", "4", "17.11", "1", "0"])).unwrap();
    assert_eq!(last, Incoming::Other(1));
  }

  #[test]
  fn test_decode_contract_data_conid() {
    let mut fields = strings(&[
      "10", "8", "3", "USD", "CASH", "", "0", "", "IDEALPRO", "ZAR", "USD.ZAR", "USD.ZAR",
      "USD.ZAR", "15016138",
    ]);
    fields.push("0.00005".into());
    assert_eq!(
      Incoming::decode(&fields).unwrap(),
      Incoming::ContractData {
        req_id: 3,
        conid: 15_016_138
      }
    );
  }

  #[test]
  fn test_decode_error_and_bad_numbers() {
    let err = Incoming::decode(&strings(&["4", "2", "3", "200", "No security definition"])).unwrap();
    assert_eq!(
      err,
      Incoming::Error {
        req_id: 3,
        code: 200,
        message: "No security definition".into()
      }
    );
    assert_eq!(Incoming::decode(&[]), Err(TwsError::Empty));
    assert!(matches!(
      Incoming::decode(&strings(&["1", "6", "x", "1", "17"])),
      Err(TwsError::InvalidNumber { index: 2, .. })
    ));
  }

  #[test]
  fn test_server_version_floor() {
    assert_eq!(server_version(&strings(&["151", "20240101 00:00:00 UTC"])), Ok(151));
    assert_eq!(
      server_version(&strings(&["100", ""])),
      Err(TwsError::UnsupportedVersion(100))
    );
  }

  #[test]
  fn test_market_data_request_layout() {
    let bytes = market_data(5, 15_016_138, &fx());
    let fields: Vec<&str> = std::str::from_utf8(&bytes[4..])
      .unwrap()
      .strip_suffix('\0')
      .unwrap()
      .split('\0')
      .collect();
    assert_eq!(&fields[..6], &["1", "11", "5", "15016138", "USD", "CASH"]);
    assert_eq!(fields[10], "IDEALPRO");
    assert_eq!(fields[12], "ZAR");
    assert_eq!(fields.len(), 20);
  }

  #[test]
  fn test_market_data_type_codes() {
    assert_eq!(MarketDataType::from_code(3), Some(MarketDataType::Delayed));
    assert_eq!(MarketDataType::from_code(0), None);
    assert_eq!(&market_data_type(MarketDataType::Delayed)[4..], b"59\x001\x003\x00");
  }
}

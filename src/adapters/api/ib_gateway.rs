//! IB Gateway Session - TWS Socket Quote Source
//!
//! Implements the `QuoteSession` port over the IB Gateway socket API
//! (the protocol TWS and IB Gateway expose on 4001/4002). One reader
//! task decodes inbound messages into a shared book of tickers and
//! pending contract lookups; every request is written through a single
//! locked write half.
//!
//! Session lifecycle:
//! 1. TCP connect, `API\0` handshake, `startApi` with the client id
//! 2. Wait for `nextValidId`, then request the configured market data type
//! 3. `qualify` resolves a contract id (or uses the configured one)
//! 4. `request_quote` subscribes once per contract; ticks fill the ticker

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::tws_codec::{self, Incoming, MarketDataType, Side};
use crate::ports::quote_session::{ContractHandle, Instrument, QuoteSession, Ticker};

/// Configuration for the gateway client.
#[derive(Debug, Clone)]
pub struct IbGatewayConfig {
  /// Gateway host.
  pub host: String,
  /// Gateway API port (4002 paper, 4001 live).
  pub port: u16,
  /// API client id; must be unique per gateway.
  pub client_id: i32,
  /// Market data flavour requested after connecting.
  pub market_data_type: MarketDataType,
  /// Bound on connecting, the handshake, and contract lookups.
  pub request_timeout: Duration,
}

impl Default for IbGatewayConfig {
  fn default() -> Self {
    Self {
      host: "127.0.0.1".to_string(),
      port: 4002,
      client_id: 1,
      market_data_type: MarketDataType::Delayed,
      request_timeout: Duration::from_secs(10),
    }
  }
}

impl IbGatewayConfig {
  pub fn address(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }
}

/// Contract lookup in flight.
struct Lookup {
  conid: Option<i64>,
  reply: oneshot::Sender<Result<i64, String>>,
}

/// Request bookkeeping shared with the reader task.
#[derive(Default)]
struct SessionBook {
  /// Instruments qualified so far, by contract id.
  contracts: HashMap<i64, Instrument>,
  /// Market data request id per contract on the current session.
  subscriptions: HashMap<i64, i32>,
  /// Latest ticker per market data request id.
  tickers: HashMap<i32, Ticker>,
  /// Pending contract lookups by request id.
  lookups: HashMap<i32, Lookup>,
}

impl SessionBook {
  fn reset_session(&mut self, reason: &str) {
    self.subscriptions.clear();
    self.tickers.clear();
    for (_, lookup) in self.lookups.drain() {
      let _ = lookup.reply.send(Err(reason.to_string()));
    }
  }
}

struct Shared {
  connected: AtomicBool,
  book: Mutex<SessionBook>,
}

impl Shared {
  /// Apply one inbound message. Returns `false` when the session is
  /// no longer usable.
  async fn apply(&self, message: Incoming) -> bool {
    let mut book = self.book.lock().await;
    match message {
      Incoming::TickPrice { req_id, side, price } => {
        if let Some(ticker) = book.tickers.get_mut(&req_id) {
          match side {
            Side::Bid => ticker.bid = Some(price),
            Side::Ask => ticker.ask = Some(price),
          }
        }
      }
      Incoming::ContractData { req_id, conid } => {
        if let Some(lookup) = book.lookups.get_mut(&req_id) {
          lookup.conid.get_or_insert(conid);
        }
      }
      Incoming::ContractDataEnd { req_id } => {
        if let Some(lookup) = book.lookups.remove(&req_id) {
          let _ = lookup
            .reply
            .send(lookup.conid.ok_or_else(|| "no contract returned".to_string()));
        }
      }
      Incoming::Error {
        req_id,
        code,
        message,
      } => {
        if let Some(lookup) = book.lookups.remove(&req_id) {
          let _ = lookup.reply.send(Err(format!("{code}: {message}")));
        } else if tws_codec::is_connectivity_lost(code) {
          warn!(code, %message, "IB gateway lost connectivity");
          self.connected.store(false, Ordering::Release);
          return false;
        } else if tws_codec::is_notice(code) {
          debug!(code, %message, "IB gateway notice");
        } else {
          warn!(req_id, code, %message, "IB gateway error");
        }
      }
      Incoming::MarketDataType { req_id, data_type } => {
        debug!(req_id, data_type, "Market data type in effect");
      }
      Incoming::NextValidId(_) | Incoming::Other(_) => {}
    }
    true
  }
}

/// IB Gateway socket session.
pub struct IbGatewaySession {
  config: IbGatewayConfig,
  shared: Arc<Shared>,
  writer: Mutex<Option<OwnedWriteHalf>>,
  reader: Mutex<Option<JoinHandle<()>>>,
  next_req_id: AtomicI32,
}

impl IbGatewaySession {
  /// Create a new (disconnected) gateway session.
  pub fn new(config: IbGatewayConfig) -> Self {
    Self {
      config,
      shared: Arc::new(Shared {
        connected: AtomicBool::new(false),
        book: Mutex::new(SessionBook::default()),
      }),
      writer: Mutex::new(None),
      reader: Mutex::new(None),
      next_req_id: AtomicI32::new(1),
    }
  }

  fn next_request_id(&self) -> i32 {
    self.next_req_id.fetch_add(1, Ordering::Relaxed)
  }

  /// Write one framed message; a write failure drops the session.
  async fn send(&self, message: &[u8]) -> Result<()> {
    let mut writer = self.writer.lock().await;
    let Some(stream) = writer.as_mut() else {
      anyhow::bail!("IB gateway session is not connected");
    };
    if let Err(e) = stream.write_all(message).await {
      self.shared.connected.store(false, Ordering::Release);
      *writer = None;
      return Err(e).context("Failed to write to IB gateway");
    }
    Ok(())
  }

  /// Drop the socket and the reader task, failing pending lookups.
  async fn close(&self) {
    self.shared.connected.store(false, Ordering::Release);
    if let Some(mut writer) = self.writer.lock().await.take() {
      let _ = writer.shutdown().await;
    }
    if let Some(reader) = self.reader.lock().await.take() {
      reader.abort();
      let _ = reader.await;
    }
    self.shared.book.lock().await.reset_session("session closed");
  }

  async fn lookup_conid(&self, instrument: &Instrument) -> Result<i64> {
    let req_id = self.next_request_id();
    let (reply, rx) = oneshot::channel();
    self
      .shared
      .book
      .lock()
      .await
      .lookups
      .insert(req_id, Lookup { conid: None, reply });

    if let Err(e) = self.send(&tws_codec::contract_details(req_id, instrument)).await {
      self.shared.book.lock().await.lookups.remove(&req_id);
      return Err(e);
    }

    let Ok(answer) = tokio::time::timeout(self.config.request_timeout, rx).await else {
      self.shared.book.lock().await.lookups.remove(&req_id);
      anyhow::bail!(
        "contract lookup for {} timed out after {}s",
        instrument.symbol,
        self.config.request_timeout.as_secs()
      );
    };

    answer
      .context("IB gateway connection closed during contract lookup")?
      .map_err(|e| anyhow::anyhow!("contract lookup for {} failed: {e}", instrument.symbol))
  }
}

/// Handshake plus `startApi`; resolves once the gateway sends `nextValidId`.
async fn handshake(
  read: &mut OwnedReadHalf,
  write: &mut OwnedWriteHalf,
  client_id: i32,
) -> Result<i32> {
  write
    .write_all(&tws_codec::handshake())
    .await
    .context("Failed to send handshake")?;
  let reply = tws_codec::read_message(read)
    .await
    .context("IB gateway closed during handshake")?;
  let version = tws_codec::server_version(&reply)?;

  write
    .write_all(&tws_codec::start_api(client_id))
    .await
    .context("Failed to send startApi")?;

  loop {
    let fields = tws_codec::read_message(read)
      .await
      .context("IB gateway closed before the session was ready")?;
    match Incoming::decode(&fields) {
      Ok(Incoming::NextValidId(_)) => return Ok(version),
      Ok(Incoming::Error { code, message, .. }) if !tws_codec::is_notice(code) => {
        anyhow::bail!("IB gateway rejected the session ({code}): {message}");
      }
      Ok(other) => debug!(?other, "Message before session ready"),
      Err(e) => debug!(error = %e, "Undecodable message before session ready"),
    }
  }
}

/// Reader task: decode until the socket closes or connectivity is lost.
async fn read_loop(mut read: OwnedReadHalf, shared: Arc<Shared>) {
  loop {
    let fields = match tws_codec::read_message(&mut read).await {
      Ok(fields) => fields,
      Err(e) => {
        warn!(error = %e, "IB gateway socket closed");
        break;
      }
    };
    match Incoming::decode(&fields) {
      Ok(message) => {
        if !shared.apply(message).await {
          break;
        }
      }
      Err(e) => debug!(error = %e, "Dropping undecodable gateway message"),
    }
  }
  shared.connected.store(false, Ordering::Release);
  shared.book.lock().await.reset_session("IB gateway connection closed");
}

#[async_trait]
impl QuoteSession for IbGatewaySession {
  #[instrument(skip(self))]
  async fn connect(&self) -> Result<()> {
    self.close().await;

    let address = self.config.address();
    let stream = tokio::time::timeout(self.config.request_timeout, TcpStream::connect(&address))
      .await
      .with_context(|| format!("Timed out connecting to {address}"))?
      .with_context(|| format!("Failed to connect to {address}"))?;
    stream.set_nodelay(true).context("Failed to set TCP_NODELAY")?;
    let (mut read, mut write) = stream.into_split();

    let server_version = tokio::time::timeout(
      self.config.request_timeout,
      handshake(&mut read, &mut write, self.config.client_id),
    )
    .await
    .context("IB gateway handshake timed out")??;

    write
      .write_all(&tws_codec::market_data_type(self.config.market_data_type))
      .await
      .context("Failed to request market data type")?;

    self.shared.connected.store(true, Ordering::Release);
    *self.reader.lock().await = Some(tokio::spawn(read_loop(read, Arc::clone(&self.shared))));
    *self.writer.lock().await = Some(write);

    info!(
      address = %address,
      client_id = self.config.client_id,
      server_version,
      market_data_type = ?self.config.market_data_type,
      "Connected to IB gateway"
    );
    Ok(())
  }

  fn is_connected(&self) -> bool {
    self.shared.connected.load(Ordering::Acquire)
  }

  #[instrument(skip(self), fields(symbol = %instrument.symbol, currency = %instrument.currency))]
  async fn qualify(&self, instrument: &Instrument) -> Result<ContractHandle> {
    let conid = match instrument.conid {
      Some(conid) => conid,
      None => self.lookup_conid(instrument).await?,
    };
    self
      .shared
      .book
      .lock()
      .await
      .contracts
      .insert(conid, instrument.clone());
    Ok(ContractHandle { conid })
  }

  async fn request_quote(&self, contract: &ContractHandle) -> Result<()> {
    let (req_id, instrument) = {
      let mut book = self.shared.book.lock().await;
      if book.subscriptions.contains_key(&contract.conid) {
        return Ok(());
      }
      let instrument = book
        .contracts
        .get(&contract.conid)
        .cloned()
        .with_context(|| format!("contract {} was not qualified", contract.conid))?;
      let req_id = self.next_request_id();
      book.subscriptions.insert(contract.conid, req_id);
      book.tickers.insert(req_id, Ticker::default());
      (req_id, instrument)
    };

    self
      .send(&tws_codec::market_data(req_id, contract.conid, &instrument))
      .await?;
    info!(conid = contract.conid, req_id, "Market data requested");
    Ok(())
  }

  async fn ticker(&self, contract: &ContractHandle) -> Result<Ticker> {
    let book = self.shared.book.lock().await;
    let req_id = book
      .subscriptions
      .get(&contract.conid)
      .with_context(|| format!("no market data requested for contract {}", contract.conid))?;
    Ok(book.tickers.get(req_id).copied().unwrap_or_default())
  }

  async fn disconnect(&self) {
    let req_ids: Vec<i32> = self
      .shared
      .book
      .lock()
      .await
      .subscriptions
      .values()
      .copied()
      .collect();
    for req_id in req_ids {
      if let Err(e) = self.send(&tws_codec::cancel_market_data(req_id)).await {
        debug!(error = %e, req_id, "Cancel market data failed");
        break;
      }
    }
    self.close().await;
    info!("Disconnected from IB gateway");
  }
}

#[cfg(test)]
mod tests {
  use rust_decimal_macros::dec;
  use tokio::io::AsyncReadExt;
  use tokio::net::TcpListener;

  use super::*;
  use crate::adapters::api::tws_codec::{encode, read_message};

  const CONID: i64 = 15_016_138;

  fn config(port: u16) -> IbGatewayConfig {
    IbGatewayConfig {
      port,
      client_id: 7,
      request_timeout: Duration::from_secs(2),
      ..IbGatewayConfig::default()
    }
  }

  async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
  }

  /// Gateway side of the handshake. Returns the `startApi` fields and
  /// the market data type request.
  async fn accept_session(listener: &TcpListener) -> (TcpStream, Vec<String>, Vec<String>) {
    let (mut socket, _) = listener.accept().await.unwrap();

    let mut prefix = [0u8; 4];
    socket.read_exact(&mut prefix).await.unwrap();
    assert_eq!(&prefix, b"API\0");
    let versions = read_message(&mut socket).await.unwrap();
    assert_eq!(versions, vec!["v151..151".to_string()]);

    socket
      .write_all(&encode(&["151", "20240101 00:00:00 UTC"]))
      .await
      .unwrap();
    let start = read_message(&mut socket).await.unwrap();

    socket
      .write_all(&encode(&["4", "2", "-1", "2104", "Market data farm connection is OK"]))
      .await
      .unwrap();
    socket.write_all(&encode(&["15", "1", "DU123456"])).await.unwrap();
    socket.write_all(&encode(&["9", "1", "1"])).await.unwrap();

    let data_type = read_message(&mut socket).await.unwrap();
    (socket, start, data_type)
  }

  async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
      while !done() {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .expect("condition never reached");
  }

  #[tokio::test]
  async fn test_qualify_subscribe_and_receive_delayed_ticks() {
    let (listener, port) = listener().await;

    let gateway = tokio::spawn(async move {
      let (mut socket, start, data_type) = accept_session(&listener).await;
      assert_eq!(start, vec!["71", "2", "7", ""]);
      assert_eq!(data_type, vec!["59", "1", "3"]);

      let lookup = read_message(&mut socket).await.unwrap();
      assert_eq!(lookup[0], "9");
      assert_eq!(lookup[4], "USD");
      assert_eq!(lookup[5], "CASH");
      assert_eq!(lookup[10], "IDEALPRO");
      assert_eq!(lookup[12], "ZAR");
      let lookup_id = lookup[2].clone();
      socket
        .write_all(&encode(&[
          "10", "8", &lookup_id, "USD", "CASH", "", "0", "", "IDEALPRO", "ZAR", "USD.ZAR",
          "USD.ZAR", "USD.ZAR", "15016138", "0.00005",
        ]))
        .await
        .unwrap();
      socket
        .write_all(&encode(&["52", "1", &lookup_id]))
        .await
        .unwrap();

      let request = read_message(&mut socket).await.unwrap();
      assert_eq!(request[0], "1");
      assert_eq!(request[3], "15016138");
      let req_id = request[2].clone();
      socket
        .write_all(&encode(&["1", "6", &req_id, "66", "17.1000", "100", "0"]))
        .await
        .unwrap();
      socket
        .write_all(&encode(&["1", "6", &req_id, "67", "17.1200", "100", "0"]))
        .await
        .unwrap();

      let cancel = read_message(&mut socket).await.unwrap();
      assert_eq!(cancel, vec!["2".to_string(), "2".to_string(), req_id]);
    });

    let session = IbGatewaySession::new(config(port));
    session.connect().await.unwrap();
    assert!(session.is_connected());

    let contract = session.qualify(&Instrument::forex("USD", "ZAR")).await.unwrap();
    assert_eq!(contract.conid, CONID);

    session.request_quote(&contract).await.unwrap();
    session.request_quote(&contract).await.unwrap();

    let mut ticker = Ticker::default();
    tokio::time::timeout(Duration::from_secs(5), async {
      while !ticker.is_populated() {
        ticker = session.ticker(&contract).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .expect("ticks never arrived");
    assert_eq!(ticker.bid, Some(dec!(17.1000)));
    assert_eq!(ticker.ask, Some(dec!(17.1200)));

    session.disconnect().await;
    assert!(!session.is_connected());
    gateway.await.unwrap();
  }

  #[tokio::test]
  async fn test_unknown_contract_fails_qualify() {
    let (listener, port) = listener().await;

    let gateway = tokio::spawn(async move {
      let (mut socket, _, _) = accept_session(&listener).await;
      let lookup = read_message(&mut socket).await.unwrap();
      socket
        .write_all(&encode(&["4", "2", &lookup[2], "200", "No security definition"]))
        .await
        .unwrap();
      socket
    });

    let session = IbGatewaySession::new(config(port));
    session.connect().await.unwrap();

    let err = session
      .qualify(&Instrument::forex("XXX", "ZAR"))
      .await
      .unwrap_err();
    assert!(err.to_string().contains("200"));
    assert!(session.is_connected());
    drop(gateway.await.unwrap());
  }

  #[tokio::test]
  async fn test_configured_conid_skips_lookup() {
    let session = IbGatewaySession::new(IbGatewayConfig::default());
    let instrument = Instrument {
      conid: Some(CONID),
      ..Instrument::forex("USD", "ZAR")
    };

    let contract = session.qualify(&instrument).await.unwrap();
    assert_eq!(contract.conid, CONID);
    assert!(session.ticker(&contract).await.is_err());
    assert!(session.request_quote(&contract).await.is_err());
  }

  #[tokio::test]
  async fn test_connectivity_loss_marks_session_down() {
    let (listener, port) = listener().await;

    let gateway = tokio::spawn(async move {
      let (mut socket, _, _) = accept_session(&listener).await;
      socket
        .write_all(&encode(&["4", "2", "-1", "1100", "Connectivity between IB and TWS has been lost"]))
        .await
        .unwrap();
      socket
    });

    let session = IbGatewaySession::new(config(port));
    session.connect().await.unwrap();
    let _socket = gateway.await.unwrap();

    wait_until(|| !session.is_connected()).await;
  }

  #[tokio::test]
  async fn test_gateway_closing_socket_marks_session_down() {
    let (listener, port) = listener().await;

    let gateway = tokio::spawn(async move {
      let (socket, _, _) = accept_session(&listener).await;
      drop(socket);
    });

    let session = IbGatewaySession::new(config(port));
    session.connect().await.unwrap();
    gateway.await.unwrap();

    wait_until(|| !session.is_connected()).await;
  }

  #[tokio::test]
  async fn test_rejected_client_id_fails_connect() {
    let (listener, port) = listener().await;

    let gateway = tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut prefix = [0u8; 4];
      socket.read_exact(&mut prefix).await.unwrap();
      read_message(&mut socket).await.unwrap();
      socket.write_all(&encode(&["151", "now"])).await.unwrap();
      read_message(&mut socket).await.unwrap();
      socket
        .write_all(&encode(&["4", "2", "-1", "326", "client id is already in use"]))
        .await
        .unwrap();
      socket
    });

    let session = IbGatewaySession::new(config(port));
    let err = session.connect().await.unwrap_err();
    assert!(format!("{err:#}").contains("326"));
    assert!(!session.is_connected());
    drop(gateway.await.unwrap());
  }

  #[tokio::test]
  async fn test_refused_connection_is_an_error() {
    let (listener, port) = listener().await;
    drop(listener);

    let session = IbGatewaySession::new(config(port));
    assert!(session.connect().await.is_err());
    assert!(!session.is_connected());
  }

  #[test]
  fn test_address() {
    let config = IbGatewayConfig {
      host: "ib-gateway".into(),
      ..IbGatewayConfig::default()
    };
    assert_eq!(config.address(), "ib-gateway:4002");
    assert_eq!(config.client_id, 1);
    assert_eq!(config.market_data_type, MarketDataType::Delayed);
  }
}

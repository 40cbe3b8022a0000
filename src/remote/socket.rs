// Socket transport for the remote bridge: request/reply over TCP
// (`tcp://host:port`) or Unix domain sockets (`ipc:///path`), one frame per
// message. The sender keeps the exchange in lockstep by dropping its
// connection on a response timeout, so a late reply can never be matched
// with the wrong request.

use std::{
  io::{Read, Write},
  net::{TcpListener, TcpStream},
  path::PathBuf,
  sync::Arc,
  time::{Duration, Instant},
};

#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  error::TransportError,
  remote::{
    endpoint::{ComEventListener, RemoteReceiver, RemoteResponse, RemoteSender},
    wire::{self, WireCommand, WireMessage},
  },
  store::ValueStore,
  value::ValueHandle,
};

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(1000);

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
enum Address {
  Tcp(String),
  #[cfg(unix)]
  Ipc(PathBuf),
}

fn parse_address(connection: &str) -> Result<Address, TransportError> {
  if let Some(rest) = connection.strip_prefix("tcp://") {
    if rest.is_empty() {
      return Err(TransportError::BadAddress(connection.to_string()));
    }
    return Ok(Address::Tcp(rest.to_string()));
  }
  #[cfg(unix)]
  if let Some(rest) = connection.strip_prefix("ipc://") {
    if rest.is_empty() {
      return Err(TransportError::BadAddress(connection.to_string()));
    }
    return Ok(Address::Ipc(PathBuf::from(rest)));
  }
  Err(TransportError::BadAddress(connection.to_string()))
}

enum FrameStream {
  Tcp(TcpStream),
  #[cfg(unix)]
  Unix(UnixStream),
}

impl FrameStream {
  fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
    match self {
      FrameStream::Tcp(s) => s.set_read_timeout(timeout),
      #[cfg(unix)]
      FrameStream::Unix(s) => s.set_read_timeout(timeout),
    }
  }
}

impl Read for FrameStream {
  fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    match self {
      FrameStream::Tcp(s) => s.read(buf),
      #[cfg(unix)]
      FrameStream::Unix(s) => s.read(buf),
    }
  }
}

impl Write for FrameStream {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    match self {
      FrameStream::Tcp(s) => s.write(buf),
      #[cfg(unix)]
      FrameStream::Unix(s) => s.write(buf),
    }
  }

  fn flush(&mut self) -> std::io::Result<()> {
    match self {
      FrameStream::Tcp(s) => s.flush(),
      #[cfg(unix)]
      FrameStream::Unix(s) => s.flush(),
    }
  }
}

fn is_timeout(error: &std::io::Error) -> bool {
  matches!(
    error.kind(),
    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
  )
}

/// Sending endpoint of the reference codec.
pub struct SocketSender {
  connection_str: String,
  address: Address,
  store: Arc<ValueStore>,
  send_timeout: Duration,
  stream: Option<FrameStream>,
}

impl SocketSender {
  pub fn new(connection: &str, store: Arc<ValueStore>) -> Result<Self, TransportError> {
    Self::with_timeout(connection, store, DEFAULT_SEND_TIMEOUT)
  }

  pub fn with_timeout(
    connection: &str,
    store: Arc<ValueStore>,
    send_timeout: Duration,
  ) -> Result<Self, TransportError> {
    Ok(SocketSender {
      connection_str: connection.to_string(),
      address: parse_address(connection)?,
      store,
      send_timeout,
      stream: None,
    })
  }

  fn dial(&self) -> Result<FrameStream, TransportError> {
    let stream = match &self.address {
      Address::Tcp(addr) => {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        FrameStream::Tcp(stream)
      }
      #[cfg(unix)]
      Address::Ipc(path) => FrameStream::Unix(UnixStream::connect(path)?),
    };
    stream.set_read_timeout(Some(self.send_timeout))?;
    Ok(stream)
  }

  /// One request/reply exchange. Any failure drops the connection so the
  /// next call starts from a clean dial.
  fn transfer(&mut self, message: &WireMessage) -> RemoteResponse {
    let payload = match wire::encode_message(message) {
      Ok(payload) => payload,
      Err(e) => {
        warn!("could not encode wire message: {e}");
        return RemoteResponse::Rejected;
      }
    };
    if self.stream.is_none() {
      match self.dial() {
        Ok(stream) => self.stream = Some(stream),
        Err(e) => {
          debug!("{}: could not connect: {e}", self.connection_str);
          return RemoteResponse::Timeout;
        }
      }
    }
    let stream = self.stream.as_mut().expect("stream was just established");
    if let Err(e) = wire::write_frame(stream, &payload) {
      debug!("{}: send failed: {e}", self.connection_str);
      self.stream = None;
      return RemoteResponse::Timeout;
    }
    match wire::read_frame(stream) {
      Ok(response) => match wire::decode_response(&response) {
        Ok(text) => RemoteResponse::parse(&text),
        Err(e) => {
          warn!("{}: malformed response: {e}", self.connection_str);
          self.stream = None;
          RemoteResponse::Rejected
        }
      },
      Err(TransportError::Io(e)) if is_timeout(&e) => {
        self.stream = None;
        RemoteResponse::Timeout
      }
      Err(e) => {
        debug!("{}: receive failed: {e}", self.connection_str);
        self.stream = None;
        RemoteResponse::Timeout
      }
    }
  }
}

impl RemoteSender for SocketSender {
  fn connect(&mut self) -> Result<(), TransportError> {
    self.stream = Some(self.dial()?);
    Ok(())
  }

  fn disconnect(&mut self) {
    self.stream = None;
  }

  fn connected(&self) -> bool {
    self.stream.is_some()
  }

  fn connection_str(&self) -> String {
    self.connection_str.clone()
  }

  fn send_value(&mut self, topic: &str, value: &ValueHandle) -> RemoteResponse {
    let message = match wire::encode_value(&self.store, topic, value) {
      Ok(message) => message,
      Err(e) => {
        warn!("cannot send value on {topic}: {e}");
        return RemoteResponse::Rejected;
      }
    };
    self.transfer(&message)
  }

  fn send_ping(&mut self, freshness: u64) {
    if self.transfer(&WireMessage::Ping { freshness }) == RemoteResponse::Timeout {
      debug!("{}: ping {freshness} timed out", self.connection_str);
    }
  }

  fn send_pong(&mut self, freshness: u64) {
    if self.transfer(&WireMessage::Pong { freshness }) == RemoteResponse::Timeout {
      debug!("{}: pong {freshness} timed out", self.connection_str);
    }
  }

  fn send_request_all(&mut self) -> RemoteResponse {
    self.transfer(&WireMessage::Command(WireCommand::SendAll))
  }

  fn send_blocked_value_injected(&mut self, topic: &str) -> RemoteResponse {
    self.transfer(&WireMessage::Command(WireCommand::ValueInjected(
      topic.to_string(),
    )))
  }

  fn send_blocked_value_rejected(&mut self, topic: &str) -> RemoteResponse {
    self.transfer(&WireMessage::Command(WireCommand::ValueRejected(
      topic.to_string(),
    )))
  }
}

enum FrameListener {
  Tcp(TcpListener),
  #[cfg(unix)]
  Unix(UnixListener),
}

/// Receiving endpoint of the reference codec. Serves one peer connection
/// at a time, answering every frame with a response frame.
pub struct SocketReceiver {
  connection_str: String,
  address: Address,
  store: Arc<ValueStore>,
  listener: Option<FrameListener>,
  client: Option<FrameStream>,
}

impl SocketReceiver {
  pub fn new(connection: &str, store: Arc<ValueStore>) -> Result<Self, TransportError> {
    Ok(SocketReceiver {
      connection_str: connection.to_string(),
      address: parse_address(connection)?,
      store,
      listener: None,
      client: None,
    })
  }

  fn try_accept(&mut self) -> bool {
    let Some(listener) = &self.listener else {
      return false;
    };
    let accepted = match listener {
      FrameListener::Tcp(l) => l.accept().map(|(s, _)| FrameStream::Tcp(s)),
      #[cfg(unix)]
      FrameListener::Unix(l) => l.accept().map(|(s, _)| FrameStream::Unix(s)),
    };
    match accepted {
      Ok(stream) => {
        let blocking_ok = match &stream {
          FrameStream::Tcp(s) => s.set_nonblocking(false).is_ok(),
          #[cfg(unix)]
          FrameStream::Unix(s) => s.set_nonblocking(false).is_ok(),
        };
        if blocking_ok {
          debug!("{}: peer connected", self.connection_str);
          self.client = Some(stream);
          true
        } else {
          false
        }
      }
      Err(ref e) if is_timeout(e) => false,
      Err(e) => {
        debug!("{}: accept failed: {e}", self.connection_str);
        false
      }
    }
  }

  fn dispatch(&self, message: WireMessage, listener: &dyn ComEventListener) -> RemoteResponse {
    match message {
      WireMessage::Ping { freshness } => {
        listener.ping_received(freshness);
        RemoteResponse::Empty
      }
      WireMessage::Pong { freshness } => {
        listener.pong_received(freshness);
        RemoteResponse::Empty
      }
      WireMessage::Command(WireCommand::SendAll) => {
        listener.request_all_received();
        RemoteResponse::Empty
      }
      WireMessage::Command(WireCommand::ValueInjected(topic)) => {
        listener.blocked_value_injected_received(&topic);
        RemoteResponse::Empty
      }
      WireMessage::Command(WireCommand::ValueRejected(topic)) => {
        listener.blocked_value_rejected_received(&topic);
        RemoteResponse::Empty
      }
      WireMessage::Value {
        topic,
        id,
        type_id,
        body,
        ext_mem,
      } => match wire::decode_value(&self.store, &type_id, id, &body, ext_mem.as_ref().map(|v| v.as_slice())) {
        Ok(value) => listener.value_received(&topic, value),
        Err(e) => {
          // a peer with a diverging type registry must not take us down
          warn!("rejecting value on {topic}: {e}");
          RemoteResponse::Rejected
        }
      },
    }
  }
}

impl RemoteReceiver for SocketReceiver {
  fn connect(&mut self) -> Result<(), TransportError> {
    let listener = match &self.address {
      Address::Tcp(addr) => {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        FrameListener::Tcp(listener)
      }
      #[cfg(unix)]
      Address::Ipc(path) => {
        // a stale socket file from a previous run blocks the bind
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        FrameListener::Unix(listener)
      }
    };
    self.listener = Some(listener);
    self.client = None;
    Ok(())
  }

  fn disconnect(&mut self) {
    self.client = None;
    self.listener = None;
    #[cfg(unix)]
    if let Address::Ipc(path) = &self.address {
      let _ = std::fs::remove_file(path);
    }
  }

  fn connected(&self) -> bool {
    self.listener.is_some()
  }

  fn receive(&mut self, timeout: Duration, listener: &dyn ComEventListener) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
      if self.client.is_none() && !self.try_accept() {
        if Instant::now() >= deadline {
          return false;
        }
        std::thread::sleep(ACCEPT_POLL_INTERVAL);
        continue;
      }
      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        return false;
      }
      let Some(client) = self.client.as_mut() else {
        continue;
      };
      let _ = client.set_read_timeout(Some(remaining));
      match wire::read_frame(client) {
        Ok(frame) => {
          let response = match wire::decode_message(&frame) {
            Ok(message) => self.dispatch(message, listener),
            Err(e) => {
              warn!("{}: malformed frame: {e}", self.connection_str);
              RemoteResponse::Rejected
            }
          };
          let client = self.client.as_mut().expect("client is connected");
          let encoded = match wire::encode_response(response.as_str()) {
            Ok(encoded) => encoded,
            Err(_) => return true,
          };
          if let Err(e) = wire::write_frame(client, &encoded) {
            debug!("{}: could not send response: {e}", self.connection_str);
            self.client = None;
          }
          return true;
        }
        Err(TransportError::Io(ref e)) if is_timeout(e) => return false,
        Err(e) => {
          debug!("{}: peer connection lost: {e}", self.connection_str);
          self.client = None;
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  #[test]
  fn address_parsing_accepts_both_schemes() {
    assert!(matches!(
      parse_address("tcp://127.0.0.1:9000"),
      Ok(Address::Tcp(_))
    ));
    #[cfg(unix)]
    assert!(matches!(
      parse_address("ipc:///tmp/mcf-test.sock"),
      Ok(Address::Ipc(_))
    ));
    assert!(parse_address("pgm://nope").is_err());
    assert!(parse_address("tcp://").is_err());
  }

  struct RecordingListener {
    pings: Mutex<Vec<u64>>,
    values: Mutex<Vec<(String, u64)>>,
  }

  impl RecordingListener {
    fn new() -> Self {
      RecordingListener {
        pings: Mutex::new(Vec::new()),
        values: Mutex::new(Vec::new()),
      }
    }
  }

  impl ComEventListener for RecordingListener {
    fn value_received(&self, topic: &str, value: ValueHandle) -> RemoteResponse {
      self
        .values
        .lock()
        .unwrap()
        .push((topic.to_string(), value.id()));
      RemoteResponse::Injected
    }
    fn ping_received(&self, freshness: u64) {
      self.pings.lock().unwrap().push(freshness);
    }
    fn pong_received(&self, _freshness: u64) {}
    fn request_all_received(&self) {}
    fn blocked_value_injected_received(&self, _topic: &str) {}
    fn blocked_value_rejected_received(&self, _topic: &str) {}
  }

  #[derive(serde::Serialize, serde::Deserialize, Default, Debug)]
  struct TestValue {
    val: i32,
  }

  fn free_tcp_endpoint() -> String {
    // bind to an ephemeral port, then release it for the receiver
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    format!("tcp://{addr}")
  }

  #[test]
  fn ping_and_value_cross_a_tcp_connection() {
    let endpoint = free_tcp_endpoint();
    let store = Arc::new(ValueStore::new());
    store.register_type::<TestValue>("TestValue");

    let mut receiver = SocketReceiver::new(&endpoint, Arc::clone(&store)).unwrap();
    receiver.connect().unwrap();
    let mut sender = SocketSender::new(&endpoint, Arc::clone(&store)).unwrap();
    sender.connect().unwrap();

    let listener = RecordingListener::new();
    let receiver_thread = std::thread::spawn(move || {
      // serve two exchanges
      let mut served = 0;
      let deadline = Instant::now() + Duration::from_secs(5);
      while served < 2 && Instant::now() < deadline {
        if receiver.receive(Duration::from_millis(100), &listener) {
          served += 1;
        }
      }
      (receiver, listener)
    });

    sender.send_ping(42);
    let response = sender.send_value("/t", &ValueHandle::new(TestValue { val: 5 }, 77));
    assert_eq!(response, RemoteResponse::Injected);

    let (_receiver, listener) = receiver_thread.join().unwrap();
    assert_eq!(*listener.pings.lock().unwrap(), vec![42]);
    assert_eq!(
      *listener.values.lock().unwrap(),
      vec![("/t".to_string(), 77)]
    );
  }

  #[test]
  fn send_without_peer_times_out() {
    let endpoint = free_tcp_endpoint();
    let store = Arc::new(ValueStore::new());
    store.register_type::<TestValue>("TestValue");
    let mut sender =
      SocketSender::with_timeout(&endpoint, store, Duration::from_millis(50)).unwrap();
    let response = sender.send_value("/t", &ValueHandle::new(TestValue { val: 1 }, 1));
    assert_eq!(response, RemoteResponse::Timeout);
  }

  #[cfg(unix)]
  #[test]
  fn ipc_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = format!("ipc://{}", dir.path().join("bridge.sock").display());
    let store = Arc::new(ValueStore::new());
    store.register_type::<TestValue>("TestValue");

    let mut receiver = SocketReceiver::new(&endpoint, Arc::clone(&store)).unwrap();
    receiver.connect().unwrap();
    let mut sender = SocketSender::new(&endpoint, Arc::clone(&store)).unwrap();
    sender.connect().unwrap();

    let listener = RecordingListener::new();
    let handle = std::thread::spawn(move || {
      receiver.receive(Duration::from_secs(5), &listener);
      listener
    });
    let response = sender.send_value("/u", &ValueHandle::new(TestValue { val: 9 }, 5));
    assert_eq!(response, RemoteResponse::Injected);
    let listener = handle.join().unwrap();
    assert_eq!(
      *listener.values.lock().unwrap(),
      vec![("/u".to_string(), 5)]
    );
  }
}

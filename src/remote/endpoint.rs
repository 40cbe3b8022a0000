// Substitutable transport endpoints of the remote bridge and the event
// surfaces connecting them to the pair and the service.

use std::time::Duration;

use crate::{error::TransportError, value::ValueHandle};

/// Stringly-typed reply every non-ping/pong message is answered with. The
/// wire carries the strings; in-process code uses the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteResponse {
  /// The value was received and injected into the target value store.
  Injected,
  /// The value was accepted for later injection; a `valueInjected` or
  /// `valueRejected` command reports the final outcome.
  Received,
  /// The receiver rejected the message.
  Rejected,
  /// No response arrived within the send timeout.
  Timeout,
  /// Acknowledgement without content, used for pings, pongs and commands.
  Empty,
}

impl RemoteResponse {
  pub fn as_str(self) -> &'static str {
    match self {
      RemoteResponse::Injected => "INJECTED",
      RemoteResponse::Received => "RECEIVED",
      RemoteResponse::Rejected => "REJECTED",
      RemoteResponse::Timeout => "TIMEOUT",
      RemoteResponse::Empty => "",
    }
  }

  /// An unknown reply counts as a rejection.
  pub fn parse(text: &str) -> Self {
    match text {
      "INJECTED" => RemoteResponse::Injected,
      "RECEIVED" => RemoteResponse::Received,
      "REJECTED" => RemoteResponse::Rejected,
      "TIMEOUT" => RemoteResponse::Timeout,
      "" => RemoteResponse::Empty,
      other => {
        log::warn!("unknown remote response {other:?}, treating as rejection");
        RemoteResponse::Rejected
      }
    }
  }
}

/// Events a receiver endpoint dispatches while a message is being
/// processed. Implemented by the pair's internal listener.
pub trait ComEventListener {
  fn value_received(&self, topic: &str, value: ValueHandle) -> RemoteResponse;
  fn ping_received(&self, freshness: u64);
  fn pong_received(&self, freshness: u64);
  fn request_all_received(&self);
  fn blocked_value_injected_received(&self, topic: &str);
  fn blocked_value_rejected_received(&self, topic: &str);
}

/// Sending half of a transport. Not thread safe; the pair serializes all
/// calls onto one thread at a time.
pub trait RemoteSender: Send {
  /// Establish the connection from previously stored parameters.
  /// Reconnecting an already connected sender may reset the connection.
  fn connect(&mut self) -> Result<(), TransportError>;

  fn disconnect(&mut self);

  fn connected(&self) -> bool;

  /// Human-readable description of the transport target.
  fn connection_str(&self) -> String;

  /// Transfer one value. Returns the peer's reply, or
  /// [`RemoteResponse::Timeout`] when none arrived in time.
  fn send_value(&mut self, topic: &str, value: &ValueHandle) -> RemoteResponse;

  fn send_ping(&mut self, freshness: u64);

  fn send_pong(&mut self, freshness: u64);

  /// Ask the peer to send one value per send rule it holds.
  fn send_request_all(&mut self) -> RemoteResponse;

  fn send_blocked_value_injected(&mut self, topic: &str) -> RemoteResponse;

  fn send_blocked_value_rejected(&mut self, topic: &str) -> RemoteResponse;
}

/// Receiving half of a transport. Not thread safe; driven by the service's
/// receiver thread.
pub trait RemoteReceiver: Send {
  fn connect(&mut self) -> Result<(), TransportError>;

  fn disconnect(&mut self);

  fn connected(&self) -> bool;

  /// Receive and dispatch at most one message. Returns true when a message
  /// was handled, false on timeout.
  fn receive(&mut self, timeout: Duration, listener: &dyn ComEventListener) -> bool;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn responses_round_trip_through_their_wire_form() {
    for response in [
      RemoteResponse::Injected,
      RemoteResponse::Received,
      RemoteResponse::Rejected,
      RemoteResponse::Timeout,
      RemoteResponse::Empty,
    ] {
      assert_eq!(RemoteResponse::parse(response.as_str()), response);
    }
  }

  #[test]
  fn unknown_response_is_a_rejection() {
    assert_eq!(RemoteResponse::parse("GARBAGE"), RemoteResponse::Rejected);
  }
}

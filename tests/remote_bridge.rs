// Two bridged stores inside one test process: every endpoint pair talks
// TCP over localhost. Covers the mirror path (send rule to receive rule),
// liveness convergence when one side starts late, and order preservation
// across the wire.

use std::{
  net::TcpListener,
  sync::Arc,
  thread,
  time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use mcf::{
  remote::{
    RemotePair, RemoteService, RemoteState, RemoteStatusTracker, SocketReceiver, SocketSender,
  },
  Component, ComponentManager, ValueQueue, ValueReceiver, ValueStore,
};

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
struct Number {
  val: i64,
}

fn free_tcp_endpoint() -> String {
  let probe = TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = probe.local_addr().unwrap();
  format!("tcp://{addr}")
}

fn new_store() -> Arc<ValueStore> {
  let store = Arc::new(ValueStore::new());
  store.register_type::<Number>("Number");
  store
}

/// Pair whose sender dials the peer's listen endpoint and whose receiver
/// serves the local one. Short intervals keep the tests fast.
fn bridge_pair(listen: &str, peer: &str, store: &Arc<ValueStore>) -> RemotePair {
  let sender = SocketSender::with_timeout(peer, Arc::clone(store), Duration::from_millis(500))
    .expect("valid peer endpoint");
  let receiver = SocketReceiver::new(listen, Arc::clone(store)).expect("valid listen endpoint");
  RemotePair::with_tracker(
    Box::new(sender),
    Box::new(receiver),
    RemoteStatusTracker::with_timing(
      Duration::from_millis(50),
      Duration::from_millis(800),
      Duration::from_millis(2000),
    ),
  )
}

struct Bridge {
  manager: ComponentManager,
  service: Arc<RemoteService>,
  store: Arc<ValueStore>,
}

impl Bridge {
  fn launch(service: Arc<RemoteService>, store: Arc<ValueStore>) -> Bridge {
    // short transport poll so teardown stays fast
    service.set_receive_timeout(Duration::from_millis(100));
    let manager = ComponentManager::new(Arc::clone(&store));
    manager.register_component_as(Arc::clone(&service) as Arc<dyn Component>, "bridge");
    manager.configure();
    manager.start();
    manager.run();
    Bridge {
      manager,
      service,
      store,
    }
  }
}

impl Drop for Bridge {
  fn drop(&mut self) {
    self.manager.stop();
  }
}

fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
  let end = Instant::now() + deadline;
  while Instant::now() < end {
    if predicate() {
      return true;
    }
    thread::sleep(Duration::from_millis(10));
  }
  false
}

#[test_log::test]
fn mirrored_topic_preserves_the_publication_sequence() -> anyhow::Result<()> {
  let endpoint_a = free_tcp_endpoint();
  let endpoint_b = free_tcp_endpoint();

  let store_a = new_store();
  let service_a = RemoteService::new(
    Arc::clone(&store_a),
    bridge_pair(&endpoint_a, &endpoint_b, &store_a),
  );
  service_a.add_send_rule("/a", "/b", 1000, false, 0);

  let store_b = new_store();
  let service_b = RemoteService::new(
    Arc::clone(&store_b),
    bridge_pair(&endpoint_b, &endpoint_a, &store_b),
  );
  service_b.add_receive_rule("/b", "/b");

  let collector = Arc::new(ValueQueue::new(0, false));
  store_b.add_receiver("/b", &(Arc::clone(&collector) as Arc<dyn ValueReceiver>));

  let bridge_a = Bridge::launch(service_a, Arc::clone(&store_a));
  let bridge_b = Bridge::launch(service_b, Arc::clone(&store_b));

  assert!(
    wait_until(Duration::from_secs(10), || {
      bridge_a.service.connected() && bridge_b.service.connected()
    }),
    "bridges never reached UP"
  );

  for val in 0..1000 {
    bridge_a.store.set_value("/a", Number { val })?;
  }

  assert!(
    wait_until(Duration::from_secs(30), || collector.len() >= 1000),
    "only {} of 1000 values arrived",
    collector.len()
  );

  for expected in 0..1000 {
    let value = collector.pop().unwrap().downcast::<Number>().unwrap();
    assert_eq!(value.val, expected);
  }
  assert_eq!(bridge_b.store.get_value::<Number>("/b").val, 999);
  Ok(())
}

#[test_log::test]
fn late_sender_converges_to_up_and_delivers_the_backlog() {
  let endpoint_a = free_tcp_endpoint();
  let endpoint_b = free_tcp_endpoint();

  // receiver side comes up first and decays while it is alone
  let store_b = new_store();
  let service_b = RemoteService::new(
    Arc::clone(&store_b),
    bridge_pair(&endpoint_b, &endpoint_a, &store_b),
  );
  service_b.add_receive_rule("/b", "/b");
  let bridge_b = Bridge::launch(Arc::clone(&service_b), Arc::clone(&store_b));

  let store_a = new_store();
  let service_a = RemoteService::new(
    Arc::clone(&store_a),
    bridge_pair(&endpoint_a, &endpoint_b, &store_a),
  );
  service_a.add_send_rule("/a", "/b", 16, false, 0);
  assert_eq!(service_a.remote_state(), RemoteState::Unsure);

  let bridge_a = Bridge::launch(Arc::clone(&service_a), Arc::clone(&store_a));
  // the backlog value waits in the send rule queue until the pair is up
  bridge_a.store.set_value("/a", Number { val: 41 }).unwrap();

  assert!(
    wait_until(Duration::from_secs(10), || {
      bridge_a.service.remote_state() == RemoteState::Up
    }),
    "sender side never reached UP"
  );
  assert!(
    wait_until(Duration::from_secs(10), || {
      bridge_b.store.get_value::<Number>("/b").val == 41
    }),
    "backlog value never arrived"
  );
}

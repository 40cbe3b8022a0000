//! In-process publish/subscribe framework for multi-threaded real-time
//! pipelines. Independent components communicate exclusively through a
//! typed, topic-addressed value store; the framework owns component
//! threads, delivers notifications, records values and optionally bridges
//! topics to peer processes.
//!
//! # Building blocks
//!
//! - [`ValueStore`]: typed topic map with multi-receiver fan-out, bounded
//!   queues and blocking back-pressure.
//! - [`Component`] / [`ComponentManager`]: per-component worker threads
//!   with a trigger/event-flag mechanism, port binding, a lifecycle state
//!   machine and real-time scheduling.
//! - [`SenderPort`], [`ReceiverPort`], [`QueuedReceiverPort`]: typed
//!   endpoints bound to topics.
//! - [`ValueRecorder`]: background serialization of every topic write to
//!   an append-only log file.
//! - [`remote`]: a paired sender/receiver mirroring selected topics across
//!   process boundaries with liveness tracking and flow control.
//!
//! # A minimal pipeline
//!
//! ```
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use mcf::{ValueStore, ValueQueue, ValueReceiver};
//!
//! #[derive(Serialize, Deserialize, Default, Debug)]
//! struct Reading { celsius: f32 }
//!
//! let store = ValueStore::new();
//! store.register_type::<Reading>("Reading");
//!
//! let queue = Arc::new(ValueQueue::new(16, false));
//! store.add_receiver("/sensor/temperature", &(Arc::clone(&queue) as Arc<dyn ValueReceiver>));
//! store.set_value("/sensor/temperature", Reading { celsius: 21.5 }).unwrap();
//!
//! let value = queue.pop().unwrap().downcast::<Reading>().unwrap();
//! assert_eq!(value.celsius, 21.5);
//! ```

pub mod component;
pub mod error;
pub mod port;
pub mod recorder;
pub mod remote;
pub mod rtsync;
pub mod store;
pub mod topics;
pub mod value;

pub use component::{
  Component, ComponentConfig, ComponentCore, ComponentLogger, ComponentManager, ComponentState,
  LogSeverity,
};
pub use error::{CodecError, ConfigError, PublishError, SchedulingError, TransportError};
pub use port::{
  GenericQueuedReceiverPort, GenericSenderPort, HandlerPort, Port, PortDirection,
  PortTriggerHandler, QueuedReceiverPort, ReceiverPort, SenderPort,
};
pub use recorder::ValueRecorder;
pub use rtsync::{SchedulingParameters, SchedulingPolicy};
pub use store::{EventFlag, EventQueue, Trigger, ValueQueue, ValueReceiver, ValueStore};
pub use value::{
  CountingIdGenerator, ExtMemBuffer, ExtMemory, IdGenerator, TypeRegistry, ValueHandle,
};

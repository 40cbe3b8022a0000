// Reference wire codec: length-delimited msgpack frames. A frame is a u32
// big-endian length followed by one packed message; replies are packed
// strings in the same framing. Ext-mem bytes travel inside the value
// message, after the serialized header fields.

use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::{
  error::{CodecError, TransportError},
  store::ValueStore,
  value::ValueHandle,
};

/// Frames larger than this are treated as protocol corruption.
const MAX_FRAME_LEN: u32 = 512 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug)]
pub enum WireCommand {
  SendAll,
  ValueInjected(String),
  ValueRejected(String),
}

#[derive(Serialize, Deserialize, Debug)]
pub enum WireMessage {
  Ping {
    freshness: u64,
  },
  Pong {
    freshness: u64,
  },
  Value {
    topic: String,
    id: u64,
    type_id: String,
    body: ByteBuf,
    ext_mem: Option<ByteBuf>,
  },
  Command(WireCommand),
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError> {
  writer.write_u32::<BE>(payload.len() as u32)?;
  writer.write_all(payload)?;
  writer.flush()?;
  Ok(())
}

pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
  let len = reader.read_u32::<BE>()?;
  if len > MAX_FRAME_LEN {
    return Err(TransportError::Io(std::io::Error::new(
      std::io::ErrorKind::InvalidData,
      format!("oversized frame of {len} bytes"),
    )));
  }
  let mut payload = vec![0u8; len as usize];
  reader.read_exact(&mut payload)?;
  Ok(payload)
}

pub fn encode_message(message: &WireMessage) -> Result<Vec<u8>, CodecError> {
  Ok(rmp_serde::to_vec(message)?)
}

pub fn decode_message(payload: &[u8]) -> Result<WireMessage, CodecError> {
  Ok(rmp_serde::from_slice(payload)?)
}

pub fn encode_response(response: &str) -> Result<Vec<u8>, CodecError> {
  Ok(rmp_serde::to_vec(response)?)
}

pub fn decode_response(payload: &[u8]) -> Result<String, CodecError> {
  Ok(rmp_serde::from_slice(payload)?)
}

/// Pack a value handle into its wire message using the store's registry.
pub fn encode_value(
  store: &ValueStore,
  topic: &str,
  value: &ValueHandle,
) -> Result<WireMessage, CodecError> {
  let type_info = store
    .type_info(value)
    .ok_or_else(|| CodecError::UnknownType(format!("value on topic {topic}")))?;
  let packed = (type_info.pack)(value, true)?;
  Ok(WireMessage::Value {
    topic: topic.to_string(),
    id: value.id(),
    type_id: type_info.type_id,
    body: ByteBuf::from(packed.bytes),
    ext_mem: packed.ext_mem.map(|b| ByteBuf::from(b.to_vec())),
  })
}

/// Rebuild a value from its wire fields. The id assigned by the sending
/// process survives the transfer.
pub fn decode_value(
  store: &ValueStore,
  type_id: &str,
  id: u64,
  body: &[u8],
  ext_mem: Option<&[u8]>,
) -> Result<ValueHandle, CodecError> {
  let type_info = store
    .type_info_by_name(type_id)
    .ok_or_else(|| CodecError::UnknownType(type_id.to_string()))?;
  let payload = (type_info.unpack)(body, ext_mem)?;
  Ok(ValueHandle::from_erased(payload, id))
}

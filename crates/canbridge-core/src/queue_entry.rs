//! The row shape shared by the in-memory ingest queue, the disk spill
//! store, and the SQL-store contract.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    codec::wire_dlc,
    frame::{Direction, Frame},
};

/// One row destined for the SQL store, or persisted to the disk spill store
/// while the store is unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Capture instant (see [`Frame::timestamp`]).
    pub timestamp: Duration,
    /// Extended (29-bit) identifier flag.
    pub extended: bool,
    /// CAN FD framing flag.
    pub fd: bool,
    /// Arbitration identifier.
    pub id: u32,
    /// Wire/SQL DLC: equals data length for classic frames, the reverse-mapped
    /// FD code for FD frames.
    pub dlc: u8,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Logical bus index.
    pub bus: u8,
    /// Direction tag ("rx" / "tx" in the SQL contract).
    pub direction: Direction,
}

impl Serialize for Direction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_sql_tag())
    }
}

impl<'de> Deserialize<'de> for Direction {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        match tag.as_str() {
            "rx" => Ok(Self::Rx),
            "tx" => Ok(Self::Tx),
            other => Err(serde::de::Error::custom(format!("unknown direction tag: {other}"))),
        }
    }
}

impl From<&Frame> for QueueEntry {
    fn from(frame: &Frame) -> Self {
        Self {
            timestamp: frame.timestamp,
            extended: frame.extended,
            fd: frame.fd,
            id: frame.id,
            dlc: wire_dlc(frame),
            payload: frame.payload.clone(),
            bus: frame.bus,
            direction: frame.direction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_tag_roundtrips_through_serde() {
        let bytes = ciborium_roundtrip(&Direction::Rx);
        assert_eq!(bytes, Direction::Rx);
        let bytes = ciborium_roundtrip(&Direction::Tx);
        assert_eq!(bytes, Direction::Tx);
    }

    fn ciborium_roundtrip<T: Serialize + for<'de> Deserialize<'de>>(value: &T) -> T {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf).expect("encode");
        ciborium::from_reader(buf.as_slice()).expect("decode")
    }
}

//! The 80-byte on-log snapshot record: `{lsid, timestamp, name[64]}`.

use bytes::{Buf, BufMut, BytesMut};

use crate::format::constants::SNAPSHOT_NAME_LEN;

/// A single named point in the LSID timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub lsid: u64,
    pub timestamp: u64,
    pub name: String,
}

impl SnapshotRecord {
    pub(super) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.lsid);
        buf.put_u64_le(self.timestamp);
        let mut name_bytes = [0u8; SNAPSHOT_NAME_LEN];
        let n = self.name.as_bytes().len().min(SNAPSHOT_NAME_LEN - 1);
        name_bytes[..n].copy_from_slice(&self.name.as_bytes()[..n]);
        buf.put_slice(&name_bytes);
    }

    pub(super) fn decode(mut cur: &[u8]) -> Self {
        let lsid = cur.get_u64_le();
        let timestamp = cur.get_u64_le();
        let nul = cur.iter().position(|&b| b == 0).unwrap_or(cur.len());
        let name = String::from_utf8_lossy(&cur[..nul]).into_owned();
        SnapshotRecord { lsid, timestamp, name }
    }
}

/// Validates a snapshot name: non-empty, fits with a NUL terminator, and
/// printable (no control characters).
pub fn validate_name(name: &str) -> bool {
    !name.is_empty()
        && name.as_bytes().len() < SNAPSHOT_NAME_LEN
        && name.chars().all(|c| !c.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips() {
        let record = SnapshotRecord {
            lsid: 12345,
            timestamp: 999,
            name: "nightly-backup".to_string(),
        };
        let mut buf = BytesMut::new();
        record.encode(&mut buf);
        let decoded = SnapshotRecord::decode(&buf);
        assert_eq!(decoded, record);
    }

    #[test]
    fn validates_names() {
        assert!(validate_name("ok-name"));
        assert!(!validate_name(""));
        assert!(!validate_name("has\tcontrol"));
        assert!(!validate_name(&"x".repeat(64)));
    }
}

//! Event-Transport Protocol (ETP) — §4.4.
//!
//! Self-describing, length-prefixed messages carried from per-CPU
//! producers to a single consumer. Grounded on the wire structs in
//! `crates/bpf/src/bpf/collector.h` (`sample_header`, `*_msg`): every
//! message starts with `{u32 size; u32 type; u64 timestamp_ns}` followed by
//! a type-specific payload, little-endian.

mod channel;

pub use channel::{Consumer, Producer, RingChannel};

use std::sync::Arc;

pub const TASK_COMM_LEN: usize = 16;

/// Wire-level message discriminant (§4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
pub enum MsgType {
    TaskMetadata = 1,
    TaskFree = 2,
    TimerFinishedProcessing = 3,
    PerfMeasurement = 4,
    TimerMigrationDetected = 5,
}

impl MsgType {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::TaskMetadata,
            2 => Self::TaskFree,
            3 => Self::TimerFinishedProcessing,
            4 => Self::PerfMeasurement,
            5 => Self::TimerMigrationDetected,
            _ => return None,
        })
    }
}

/// A fully decoded wire message, tagged with its emission timestamp (§3,
/// "Wire message" entity).
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Message {
    TaskMetadata {
        timestamp_ns: u64,
        pid: u32,
        comm: [u8; TASK_COMM_LEN],
        cgroup_id: u64,
    },
    TaskFree {
        timestamp_ns: u64,
        pid: u32,
    },
    PerfMeasurement {
        timestamp_ns: u64,
        pid: u32,
        cycles_delta: u64,
        instructions_delta: u64,
        llc_misses_delta: u64,
        cache_refs_delta: u64,
        time_delta_ns: u64,
        is_context_switch: bool,
        next_tgid: u32,
    },
    TimerFinishedProcessing {
        timestamp_ns: u64,
    },
    TimerMigrationDetected {
        timestamp_ns: u64,
        expected_cpu: u32,
        actual_cpu: u32,
    },
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::TaskMetadata { .. } => MsgType::TaskMetadata,
            Self::TaskFree { .. } => MsgType::TaskFree,
            Self::PerfMeasurement { .. } => MsgType::PerfMeasurement,
            Self::TimerFinishedProcessing { .. } => MsgType::TimerFinishedProcessing,
            Self::TimerMigrationDetected { .. } => MsgType::TimerMigrationDetected,
        }
    }

    pub fn timestamp_ns(&self) -> u64 {
        match self {
            Self::TaskMetadata { timestamp_ns, .. }
            | Self::TaskFree { timestamp_ns, .. }
            | Self::PerfMeasurement { timestamp_ns, .. }
            | Self::TimerFinishedProcessing { timestamp_ns }
            | Self::TimerMigrationDetected { timestamp_ns, .. } => *timestamp_ns,
        }
    }

    /// Appends the wire encoding of this message to `buf`, backpatching the
    /// `size` field once the full frame length is known.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.extend_from_slice(&0u32.to_le_bytes()); // size placeholder
        buf.extend_from_slice(&(self.msg_type() as u32).to_le_bytes());
        buf.extend_from_slice(&self.timestamp_ns().to_le_bytes());

        match self {
            Self::TaskMetadata { pid, comm, cgroup_id, .. } => {
                buf.extend_from_slice(&pid.to_le_bytes());
                buf.extend_from_slice(comm);
                buf.extend_from_slice(&cgroup_id.to_le_bytes());
            }
            Self::TaskFree { pid, .. } => {
                buf.extend_from_slice(&pid.to_le_bytes());
            }
            Self::PerfMeasurement {
                pid,
                cycles_delta,
                instructions_delta,
                llc_misses_delta,
                cache_refs_delta,
                time_delta_ns,
                is_context_switch,
                next_tgid,
                ..
            } => {
                buf.extend_from_slice(&pid.to_le_bytes());
                buf.extend_from_slice(&cycles_delta.to_le_bytes());
                buf.extend_from_slice(&instructions_delta.to_le_bytes());
                buf.extend_from_slice(&llc_misses_delta.to_le_bytes());
                buf.extend_from_slice(&cache_refs_delta.to_le_bytes());
                buf.extend_from_slice(&time_delta_ns.to_le_bytes());
                buf.extend_from_slice(&(*is_context_switch as u32).to_le_bytes());
                buf.extend_from_slice(&next_tgid.to_le_bytes());
            }
            Self::TimerFinishedProcessing { .. } => {}
            Self::TimerMigrationDetected {
                expected_cpu,
                actual_cpu,
                ..
            } => {
                buf.extend_from_slice(&expected_cpu.to_le_bytes());
                buf.extend_from_slice(&actual_cpu.to_le_bytes());
            }
        }

        let size = (buf.len() - start) as u32;
        buf[start..start + 4].copy_from_slice(&size.to_le_bytes());
    }

    /// Decodes one frame from the front of `bytes`. Returns the message and
    /// the number of bytes consumed, or `None` if `bytes` does not contain
    /// a complete, recognized frame.
    pub fn decode(bytes: &[u8]) -> Option<(Self, usize)> {
        if bytes.len() < 16 {
            return None;
        }
        let size = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let ty = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let timestamp_ns = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        if bytes.len() < size {
            return None;
        }
        let payload = &bytes[16..size];
        let ty = MsgType::from_u32(ty)?;

        let msg = match ty {
            MsgType::TaskMetadata => {
                if payload.len() < 4 + TASK_COMM_LEN + 8 {
                    return None;
                }
                let pid = u32::from_le_bytes(payload[0..4].try_into().unwrap());
                let mut comm = [0u8; TASK_COMM_LEN];
                comm.copy_from_slice(&payload[4..4 + TASK_COMM_LEN]);
                let cgroup_id =
                    u64::from_le_bytes(payload[4 + TASK_COMM_LEN..12 + TASK_COMM_LEN].try_into().unwrap());
                Self::TaskMetadata {
                    timestamp_ns,
                    pid,
                    comm,
                    cgroup_id,
                }
            }
            MsgType::TaskFree => {
                if payload.len() < 4 {
                    return None;
                }
                let pid = u32::from_le_bytes(payload[0..4].try_into().unwrap());
                Self::TaskFree { timestamp_ns, pid }
            }
            MsgType::PerfMeasurement => {
                if payload.len() < 4 + 8 * 5 + 4 + 4 {
                    return None;
                }
                let pid = u32::from_le_bytes(payload[0..4].try_into().unwrap());
                let cycles_delta = u64::from_le_bytes(payload[4..12].try_into().unwrap());
                let instructions_delta = u64::from_le_bytes(payload[12..20].try_into().unwrap());
                let llc_misses_delta = u64::from_le_bytes(payload[20..28].try_into().unwrap());
                let cache_refs_delta = u64::from_le_bytes(payload[28..36].try_into().unwrap());
                let time_delta_ns = u64::from_le_bytes(payload[36..44].try_into().unwrap());
                let is_context_switch = u32::from_le_bytes(payload[44..48].try_into().unwrap()) != 0;
                let next_tgid = u32::from_le_bytes(payload[48..52].try_into().unwrap());
                Self::PerfMeasurement {
                    timestamp_ns,
                    pid,
                    cycles_delta,
                    instructions_delta,
                    llc_misses_delta,
                    cache_refs_delta,
                    time_delta_ns,
                    is_context_switch,
                    next_tgid,
                }
            }
            MsgType::TimerFinishedProcessing => Self::TimerFinishedProcessing { timestamp_ns },
            MsgType::TimerMigrationDetected => {
                if payload.len() < 8 {
                    return None;
                }
                let expected_cpu = u32::from_le_bytes(payload[0..4].try_into().unwrap());
                let actual_cpu = u32::from_le_bytes(payload[4..8].try_into().unwrap());
                Self::TimerMigrationDetected {
                    timestamp_ns,
                    expected_cpu,
                    actual_cpu,
                }
            }
        };

        Some((msg, size))
    }
}

/// One [`RingChannel`] per online CPU, the producer sides handed out to the
/// sampling coordinator and the consumer side drained by the caller.
pub struct EventTransport {
    channels: Vec<Arc<RingChannel>>,
}

impl EventTransport {
    pub fn new(num_cpus: usize, channel_capacity: usize) -> Self {
        Self {
            channels: (0..num_cpus)
                .map(|_| Arc::new(RingChannel::new(channel_capacity)))
                .collect(),
        }
    }

    pub fn producer(&self, cpu: usize) -> Producer {
        Producer::new(Arc::clone(&self.channels[cpu]))
    }

    pub fn consumer(&self, cpu: usize) -> Consumer {
        Consumer::new(Arc::clone(&self.channels[cpu]))
    }

    pub fn num_cpus(&self) -> usize {
        self.channels.len()
    }

    pub fn total_dropped(&self) -> u64 {
        self.channels.iter().map(|c| c.dropped()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_message_kind() {
        let msgs = vec![
            Message::TaskMetadata {
                timestamp_ns: 1,
                pid: 100,
                comm: *b"myproc\0\0\0\0\0\0\0\0\0\0",
                cgroup_id: 42,
            },
            Message::TaskFree {
                timestamp_ns: 2,
                pid: 100,
            },
            Message::PerfMeasurement {
                timestamp_ns: 3,
                pid: 100,
                cycles_delta: 1100,
                instructions_delta: 2100,
                llc_misses_delta: 15,
                cache_refs_delta: 115,
                time_delta_ns: 1_000_000,
                is_context_switch: true,
                next_tgid: 200,
            },
            Message::TimerFinishedProcessing { timestamp_ns: 4 },
            Message::TimerMigrationDetected {
                timestamp_ns: 5,
                expected_cpu: 0,
                actual_cpu: 1,
            },
        ];

        for msg in msgs {
            let mut buf = Vec::new();
            msg.encode(&mut buf);
            let (decoded, consumed) = Message::decode(&buf).expect("decode failed");
            assert_eq!(consumed, buf.len());
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn decode_rejects_truncated_frame() {
        let mut buf = Vec::new();
        Message::TaskFree {
            timestamp_ns: 1,
            pid: 7,
        }
        .encode(&mut buf);
        assert!(Message::decode(&buf[..buf.len() - 1]).is_none());
    }
}

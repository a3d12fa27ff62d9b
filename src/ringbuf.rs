//! Decoder for the sample ring shared with the kernel.
//!
//! The kernel writes variable-length records into a circular data region and
//! publishes its write position through the control page. Decoding walks the
//! region from the consumer offset to the producer offset, with every byte
//! position taken modulo the region size. Records are decoded into a tagged
//! enum instead of overlaying structs on the shared pages.

/// Record type the kernel uses for counter-overflow samples.
pub const PERF_RECORD_SAMPLE: u32 = 9;

/// `struct perf_event_header`: type u32, misc u16, size u16.
const HEADER_SIZE: u64 = 8;

/// One record pulled out of the sample ring.
///
/// `Sample` carries only the instruction pointer: it is the first field of
/// the payload because `PERF_SAMPLE_IP` is the first field class requested.
/// The trailing tid/pid words are skipped by advancing the consumer by the
/// record's declared size, never assumed absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingRecord {
    Sample { ip: u64 },
    Unknown { kind: u32, size: u16 },
}

/// Decode every record between `consumer` and `producer`.
///
/// Both offsets grow without bound; `data` is the circular region they are
/// taken modulo. A record with a declared size of zero marks the point past
/// which the producer never wrote (an exhausted or torn buffer): decoding
/// stops there and everything already collected is returned, not an error.
pub fn decode_records(data: &[u8], mut consumer: u64, producer: u64) -> Vec<RingRecord> {
    let mut records = Vec::new();
    if data.is_empty() {
        return records;
    }
    while consumer < producer {
        let header: [u8; 8] = read_wrapped(data, consumer);
        let kind = u32::from_ne_bytes(header[0..4].try_into().unwrap());
        let size = u16::from_ne_bytes(header[6..8].try_into().unwrap());
        if size == 0 {
            break;
        }
        if kind == PERF_RECORD_SAMPLE && u64::from(size) >= HEADER_SIZE + 8 {
            let payload: [u8; 8] = read_wrapped(data, consumer + HEADER_SIZE);
            records.push(RingRecord::Sample {
                ip: u64::from_ne_bytes(payload),
            });
        } else {
            records.push(RingRecord::Unknown { kind, size });
        }
        consumer += u64::from(size);
    }
    records
}

/// The instruction pointers of the sample records, in arrival order.
pub fn sample_addresses(records: &[RingRecord]) -> Vec<u64> {
    records
        .iter()
        .filter_map(|record| match record {
            RingRecord::Sample { ip } => Some(*ip),
            RingRecord::Unknown { .. } => None,
        })
        .collect()
}

/// Read `N` bytes starting at `pos mod data.len()`, wrapping past the end
/// of the region.
fn read_wrapped<const N: usize>(data: &[u8], pos: u64) -> [u8; N] {
    let len = data.len() as u64;
    let mut out = [0u8; N];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = data[((pos + i as u64) % len) as usize];
    }
    out
}

//! Process-data engine (spec §4.12): one call per cycle emits the group's
//! segments as LRW (or LRD+LWR when a slave blocks LRW), with the first
//! segment carrying an appended FRMW for the DC reference clock. Receive
//! pops the index stack in push order and reconciles work counters.

use heapless::Vec;

use crate::datagram::{Command, FrameBuilder};
use crate::dc;
use crate::error::Error;
use crate::ethernet::PRIMARY_MAC;
use crate::group::Group;
use crate::link::RawEthernetPort;
use crate::osal::{Deadline, Osal};
use crate::port::Port;

/// Upper bound on segments in flight for one cycle (mirrors `group::MAX_SEGMENTS`).
pub const MAX_INFLIGHT: usize = crate::group::MAX_SEGMENTS;

/// The opaque batch `send_cycle` hands back to `receive_cycle` (spec §3
/// "Index stack"). Callers only ever move it between the two calls.
pub type Inflight = Vec<InflightSegment, MAX_INFLIGHT>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Lrw,
    Lrd,
    Lwr,
}

/// One segment pushed on the index stack after sending (spec §4.12 step 3:
/// "push {index, dest-ptr, length, dc-offset}"). `dest_offset` is the byte
/// offset into the caller's `inputs` buffer this segment's logical range
/// maps to.
#[derive(Debug, Clone, Copy)]
pub struct InflightSegment {
    index: u8,
    kind: SegmentKind,
    dest_offset: usize,
    length: u16,
    has_dc: bool,
}

/// Totals accumulated across a cycle's receive phase (spec §8 "the
/// work-counter total equals `group.outputsWKC*2 + group.inputsWKC`").
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleResult {
    pub working_counter: u32,
    pub any_arrived: bool,
    /// The DC reference slave's SYSTIME, if a DC FRMW was embedded this cycle.
    pub reference_systime_ns: Option<u64>,
}

fn send_one<L: RawEthernetPort>(
    port: &mut Port<L>,
    command: Command,
    payload: &[u8],
    dc_reference: Option<u16>,
) -> Result<(u8, bool), Error> {
    let idx = port.acquire_index()?;
    let mut buf = [0u8; crate::port::MAX_FRAME];
    let mut has_dc = false;
    {
        let mut b = FrameBuilder::init(&mut buf, PRIMARY_MAC)?;
        b.push(idx, command, payload)?;
        if let Some(reference) = dc_reference {
            b.push(idx, dc::frmw_command(reference), &[0u8; 8])?;
            has_dc = true;
        }
        let frame = b.finish();
        port.stage(idx, frame)?;
    }
    port.send(idx)?;
    Ok((idx, has_dc))
}

/// Emits one cycle's datagrams for `group` (spec §4.12 steps 1-3).
///
/// `lrw_blocked` reflects whether any slave in the group cannot accept LRW
/// (the mapping engine records this at config-map-group time); when true the
/// cycle falls back to LRD followed by LWR over the same logical range.
/// `dc_reference_station_address` is `Some` only when DC is active for this
/// group; the embedded FRMW is appended to the first segment's datagram only.
pub fn send_cycle<L: RawEthernetPort>(
    port: &mut Port<L>,
    group: &Group,
    outputs: &[u8],
    lrw_blocked: bool,
    dc_reference_station_address: Option<u16>,
) -> Result<Inflight, Error> {
    let mut inflight = Vec::new();
    let zeros = [0u8; 1486];

    for (seg_no, segment) in group.segments.iter().enumerate() {
        let dest_offset = (segment.logical_address - group.logical_start_address) as usize;
        let out_end = (dest_offset + segment.length as usize).min(outputs.len());
        let out_slice = if dest_offset < outputs.len() { &outputs[dest_offset..out_end] } else { &[] };
        let dc_reference = if seg_no == 0 { dc_reference_station_address } else { None };

        if lrw_blocked {
            let (idx, has_dc) = send_one(
                port,
                Command::Lrd { address: segment.logical_address },
                &zeros[..segment.length as usize],
                dc_reference,
            )?;
            inflight
                .push(InflightSegment { index: idx, kind: SegmentKind::Lrd, dest_offset, length: segment.length, has_dc })
                .map_err(|_| Error::Capacity)?;

            let (wr_idx, _) =
                send_one(port, Command::Lwr { address: segment.logical_address }, out_slice, None)?;
            inflight
                .push(InflightSegment { index: wr_idx, kind: SegmentKind::Lwr, dest_offset, length: segment.length, has_dc: false })
                .map_err(|_| Error::Capacity)?;
        } else {
            let mut padded = [0u8; 1486];
            let n = out_slice.len().min(padded.len());
            padded[..n].copy_from_slice(&out_slice[..n]);
            let (idx, has_dc) =
                send_one(port, Command::Lrw { address: segment.logical_address }, &padded[..segment.length as usize], dc_reference)?;
            inflight
                .push(InflightSegment { index: idx, kind: SegmentKind::Lrw, dest_offset, length: segment.length, has_dc })
                .map_err(|_| Error::Capacity)?;
        }
    }
    Ok(inflight)
}

/// Receive phase (spec §4.12 "Receive phase"): pops in push order, waits on
/// each index, copies read data into `inputs`, extracts any DC timestamp,
/// and totals the work counter. Never blocks past `timeout_ns` overall.
pub fn receive_cycle<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    inflight: Inflight,
    inputs: &mut [u8],
    timeout_ns: u64,
) -> Result<CycleResult, Error> {
    let deadline = Deadline::after(osal, timeout_ns);
    let mut result = CycleResult::default();

    for seg in inflight {
        let wkc = match port.wait_index(seg.index, osal, deadline) {
            Ok(wkc) => wkc,
            Err(Error::Port(crate::error::PortError::Timeout)) | Err(Error::NoFrame) => 0,
            Err(e) => return Err(e),
        };
        if wkc > 0 {
            result.any_arrived = true;
        }
        result.working_counter += match seg.kind {
            SegmentKind::Lwr => wkc as u32 * 2,
            _ => wkc as u32,
        };

        let payload = port.rx_payload(seg.index);
        let mut views = crate::datagram::iter_datagrams(payload);
        if let Some(view) = views.next() {
            if matches!(seg.kind, SegmentKind::Lrd | SegmentKind::Lrw) {
                let data = view.data();
                let n = (inputs.len().saturating_sub(seg.dest_offset)).min(data.len()).min(seg.length as usize);
                if seg.dest_offset < inputs.len() {
                    inputs[seg.dest_offset..seg.dest_offset + n].copy_from_slice(&data[..n]);
                }
            }
        }
        if seg.has_dc {
            if let Some(dc_view) = views.next() {
                let d = dc_view.data();
                if d.len() >= 8 {
                    result.reference_systime_ns = Some(u64::from_le_bytes(d[..8].try_into().unwrap()));
                }
            }
        }
    }

    if !result.any_arrived {
        return Err(Error::NoFrame);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{Group, Segment};
    use crate::link::loopback::LoopbackPort;

    struct FakeClock;
    impl Osal for FakeClock {
        fn now_ns(&self) -> u64 {
            0
        }
        fn usleep(&self, _micros: u32) {}
    }

    #[test]
    fn lrw_segment_round_trips_with_full_wkc() {
        let mut port = Port::new(LoopbackPort::new());
        let mut group = Group::new(0x0001_0000);
        let _ = group.segments.push(Segment { logical_address: 0x0001_0000, length: 4 });
        group.output_bytes = 4;
        group.input_bytes = 4;

        let outputs = [1u8, 2, 3, 4];
        let inflight = send_cycle(&mut port, &group, &outputs, false, None).unwrap();
        let idx = inflight[0].index;

        let mut buf = [0u8; 64];
        let mut b = FrameBuilder::init(&mut buf, PRIMARY_MAC).unwrap();
        b.push(idx, Command::Lrw { address: 0x0001_0000 }, &[9u8, 8, 7, 6]).unwrap();
        let mut reply = b.finish().to_vec();
        reply[6..12].copy_from_slice(&[0x12, 0x10, 0x10, 0x10, 0x10, 0x10]);
        let wkc_offset = reply.len() - 2;
        reply[wkc_offset..].copy_from_slice(&2u16.to_le_bytes());
        port.primary_link_for_test().inject(&reply);

        let mut inputs = [0u8; 4];
        let result = receive_cycle(&mut port, &FakeClock, inflight, &mut inputs, 1_000_000_000).unwrap();
        assert_eq!(inputs, [9, 8, 7, 6]);
        assert_eq!(result.working_counter, 2);
        assert!(result.any_arrived);
    }

    #[test]
    fn lwr_segment_counts_work_counter_twice() {
        let mut port = Port::new(LoopbackPort::new());
        let mut group = Group::new(0x0002_0000);
        let _ = group.segments.push(Segment { logical_address: 0x0002_0000, length: 2 });

        let outputs = [5u8, 6];
        let inflight = send_cycle(&mut port, &group, &outputs, true, None).unwrap();
        assert_eq!(inflight.len(), 2);

        for seg in &inflight {
            let mut buf = [0u8; 64];
            let cmd = match seg.kind {
                SegmentKind::Lrd => Command::Lrd { address: 0x0002_0000 },
                SegmentKind::Lwr => Command::Lwr { address: 0x0002_0000 },
                SegmentKind::Lrw => unreachable!(),
            };
            let mut b = FrameBuilder::init(&mut buf, PRIMARY_MAC).unwrap();
            b.push(seg.index, cmd, &[0u8, 0]).unwrap();
            let mut reply = b.finish().to_vec();
            reply[6..12].copy_from_slice(&[0x12, 0x10, 0x10, 0x10, 0x10, 0x10]);
            let wkc_offset = reply.len() - 2;
            reply[wkc_offset..].copy_from_slice(&1u16.to_le_bytes());
            port.primary_link_for_test().inject(&reply);
        }

        let mut inputs = [0u8; 2];
        let result = receive_cycle(&mut port, &FakeClock, inflight, &mut inputs, 1_000_000_000).unwrap();
        // One LRD wkc(1) + one LWR wkc(1)*2 = 3, matching outputsWKC*2 + inputsWKC (spec §8).
        assert_eq!(result.working_counter, 3);
    }
}

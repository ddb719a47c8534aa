/*!
    cyclic exchange of the process image

    Each cycle, the outputs of the image are sent in logical read-write (LRW) PDUs covering the process data of the active slaves. Every slave writes its inputs into the PDUs and takes its outputs from them as they pass, so one traversal of the segment exchanges the whole image. When the image does not fit in one PDU it is split, and PDUs are grouped into as few frames as possible.

    The working counter expected for each PDU is computed from the slaves its range covers:

    - +1 for each slave reading inputs, in [AlState::SafeOperational] or [AlState::Operational]
    - +2 for each slave writing outputs, in [AlState::Operational] only

    Any deficit means some slave did not process the PDU, and the image is left unchanged for this cycle.
*/

use core::ops::Range;
use crate::{
    rawmaster::RawMaster,
    frame::{Frame, Pdu, PduCommand, PDU_HEADER, PDU_FOOTER, MAX_PDU_DATA},
    registers::AlState,
    mapping::{ImageLayout, ProcessImage},
    error::{EthercatError, EthercatResult},
    };


/// one LRW PDU of the cycle
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Datagram {
    /// logical address of the first byte
    pub address: u32,
    /// bytes of the image carried
    pub range: Range<usize>,
    /// working counter of a complete exchange
    pub expected: u16,
}

/**
    plan of the cyclic exchange for the current set of active slaves

    The plan only depends on the layout and on the slaves' states, so it is computed once and replaced when the active set changes.
*/
#[derive(Clone, Debug, Default)]
pub struct Scheduler {
    /// datagrams grouped by frame
    frames: Vec<Vec<Datagram>>,
    /// station addresses of the slaves whose inputs are exchanged
    active: Vec<u16>,
    /// datagrams covering the region of one slave only
    isolated: Vec<(u16, Vec<Datagram>)>,
    /// parts of the image not exchanged completely by the last cycle
    short: Vec<Range<usize>>,
}

impl Scheduler {
    /**
        plan the exchange of the regions of the given slaves

        `active` lists station addresses with the state of the slave, slaves not in a state exchanging process data are ignored. `capacity` is the maximum body size of a frame.
    */
    pub fn plan(layout: &ImageLayout, active: &[(u16, AlState)], capacity: usize) -> EthercatResult<Self> {
        let chunk = capacity.saturating_sub(PDU_HEADER + PDU_FOOTER).min(MAX_PDU_DATA);
        if chunk == 0
            {return Err(EthercatError::Master("frames are too small for process data"))}

        let state = |station| active.iter()
            .find(|(active, _)| *active == station)
            .map(|(_, state)| *state)
            .filter(|state| state.exchanges_process_data());

        // contiguous spans of the image covered by active slaves
        let mut spans: Vec<Range<usize>> = Vec::new();
        let mut stations = Vec::new();
        for region in layout.regions() {
            if state(region.station).is_none()
                {continue}
            stations.push(region.station);
            let range = region.range();
            if range.is_empty()
                {continue}
            match spans.last_mut() {
                Some(last) if last.end == range.start => last.end = range.end,
                _ => spans.push(range),
            }
        }

        let datagrams = |span: Range<usize>| -> EthercatResult<Vec<Datagram>> {
            let mut datagrams = Vec::new();
            let mut start = span.start;
            while start < span.end {
                let range = start .. (start + chunk).min(span.end);
                start = range.end;

                let mut expected = 0;
                for region in layout.regions() {
                    let Some(slave_state) = state(region.station)
                        else {continue};
                    if overlaps(&range, &region.inputs)
                        {expected += 1}
                    if overlaps(&range, &region.outputs) && slave_state == AlState::Operational
                        {expected += 2}
                }
                let address = u32::try_from(range.start).ok()
                    .and_then(|offset| layout.start().checked_add(offset))
                    .ok_or(EthercatError::Master("process image exceeds the logical memory"))?;
                datagrams.push(Datagram {address, range, expected});
            }
            Ok(datagrams)
        };

        let mut frames: Vec<Vec<Datagram>> = Vec::new();
        let mut used = capacity;
        for span in spans {
            for datagram in datagrams(span)? {
                let size = PDU_HEADER + datagram.range.len() + PDU_FOOTER;
                if used + size > capacity {
                    frames.push(Vec::new());
                    used = 0;
                }
                used += size;
                if let Some(frame) = frames.last_mut() {
                    frame.push(datagram);
                }
            }
        }
        // regions do not overlap, so these working counters only depend on their slave
        let mut isolated = Vec::new();
        for region in layout.regions() {
            if ! stations.contains(&region.station)
                {continue}
            let alone: Vec<Datagram> = datagrams(region.range())?.into_iter()
                .filter(|datagram| datagram.expected != 0)
                .collect();
            if ! alone.is_empty() {
                isolated.push((region.station, alone));
            }
        }
        log::debug!("process data exchanged in {} frames for {} slaves", frames.len(), stations.len());
        Ok(Self {frames, active: stations, isolated, short: Vec::new()})
    }

    /// station addresses of the slaves taking part in the exchange
    pub fn active(&self) -> &[u16]  {&self.active}
    /// datagrams of each frame sent per cycle
    pub fn frames(&self) -> &[Vec<Datagram>]  {&self.frames}
    /// working counter of a complete cycle
    pub fn expected(&self) -> u16 {
        self.frames.iter().flatten().map(|datagram| datagram.expected).sum()
    }

    /**
        exchange the process image with the segment, once

        The outputs are copied from `image` before sending. The received inputs are copied to `image` only if every datagram came back with its expected working counter, otherwise [EthercatError::PartialCycleFailure] is returned with the summed working counters and the image keeps the inputs of the last complete cycle. A lost frame counts as a working counter of 0.

        Returns the working counter of the cycle.
    */
    pub fn exchange(&mut self, raw: &mut RawMaster, image: &ProcessImage) -> EthercatResult<u16> {
        let outgoing = image.snapshot();
        let mut received = outgoing.clone();
        let (mut expected, mut answered) = (0, 0);
        self.short.clear();

        for datagrams in self.frames.iter() {
            let mut frame = Frame::with(datagrams.iter()
                .map(|datagram| Pdu::logical(PduCommand::LRW, datagram.address, outgoing[datagram.range.clone()].to_vec()))
                .collect());
            expected += datagrams.iter().map(|datagram| datagram.expected).sum::<u16>();
            match raw.transact(&mut frame) {
                Ok(()) => for (datagram, pdu) in datagrams.iter().zip(frame.pdus) {
                    answered += pdu.working_count;
                    if pdu.working_count == datagram.expected {
                        received[datagram.range.clone()].copy_from_slice(&pdu.data);
                    }
                    else {
                        log::debug!("datagram at {:#x}: working counter {} instead of {}",
                            datagram.address, pdu.working_count, datagram.expected);
                        self.short.push(datagram.range.clone());
                    }
                },
                Err(EthercatError::Timeout(_)) => self.short.extend(datagrams.iter().map(|datagram| datagram.range.clone())),
                Err(err) => return Err(err),
            }
        }
        if ! self.short.is_empty() {
            log::warn!("partial cycle: working counter {} instead of {}", answered, expected);
            return Err(EthercatError::PartialCycleFailure {expected, answered});
        }
        image.commit_inputs(&received, &self.active);
        Ok(answered)
    }

    /// slaves whose region was not exchanged completely by the last cycle
    pub fn suspects(&self) -> Vec<u16> {
        self.isolated.iter()
            .filter(|(_, datagrams)| datagrams.iter().any(|datagram|
                self.short.iter().any(|short| overlaps(short, &datagram.range))))
            .map(|(station, _)| *station)
            .collect()
    }

    /**
        exchange the region of each given slave alone, and return the slaves falling short

        This tells which slave of a datagram did not process it. The inputs received are not committed to the image. A lost frame says nothing about its slave, which is then not reported.
    */
    pub fn isolate(&self, raw: &mut RawMaster, image: &ProcessImage, stations: &[u16]) -> EthercatResult<Vec<u16>> {
        let outgoing = image.snapshot();
        let mut failing = Vec::new();
        for (station, datagrams) in self.isolated.iter().filter(|(station, _)| stations.contains(station)) {
            for datagram in datagrams {
                let mut frame = Frame::with(vec![
                    Pdu::logical(PduCommand::LRW, datagram.address, outgoing[datagram.range.clone()].to_vec()),
                    ]);
                match raw.transact(&mut frame) {
                    Ok(()) => {
                        let answered = frame.pdus.iter().map(|pdu| pdu.working_count).sum::<u16>();
                        if answered != datagram.expected {
                            log::debug!("slave {}: working counter {} instead of {} alone",
                                station, answered, datagram.expected);
                            failing.push(*station);
                            break
                        }
                    },
                    Err(EthercatError::Timeout(_)) => break,
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(failing)
    }
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}


#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use crate::{
        mailbox::Buffer,
        frame::MAX_FRAME_BODY,
        socket::{SimulatedBus, SimulatedSlave},
        topology::Topology,
        config::MasterConfig,
        slave::SlaveStateMachine,
        };
    use AlState::*;

    fn image_layout(sizes: &[(u16, u16)]) -> ImageLayout {
        let mut layout = ImageLayout::new(0x1_0000);
        for (station, (outputs, inputs)) in (1 ..).zip(sizes) {
            layout.push(station, Buffer {address: 0x1100, size: *outputs}, Buffer {address: 0x1180, size: *inputs});
        }
        layout
    }

    #[test]
    fn working_counters() {
        let layout = image_layout(&[(2, 2), (0, 4), (4, 0)]);
        let plan = Scheduler::plan(&layout, &[(1, Operational), (2, SafeOperational), (3, Operational)], MAX_FRAME_BODY).unwrap();
        assert_eq!(plan.frames(), [vec![Datagram {address: 0x1_0000, range: 0 .. 12, expected: 3 + 1 + 2}]]);
        assert_eq!(plan.active(), [1, 2, 3]);

        // a slave missing from the active set splits the span, one not exchanging is ignored
        let plan = Scheduler::plan(&layout, &[(1, Operational), (2, PreOperational), (3, SafeOperational)], MAX_FRAME_BODY).unwrap();
        assert_eq!(plan.frames(), [vec![
            Datagram {address: 0x1_0000, range: 0 .. 4, expected: 3},
            Datagram {address: 0x1_0008, range: 8 .. 12, expected: 0},
            ]]);
        assert_eq!(plan.active(), [1, 3]);
        assert_eq!(plan.expected(), 3);
    }

    #[test]
    fn split_in_frames() {
        let layout = image_layout(&[(600, 600), (600, 0)]);
        let active = [(1, Operational), (2, Operational)];
        let plan = Scheduler::plan(&layout, &active, 1000).unwrap();
        // 988 bytes of data per datagram, one datagram per frame
        let ranges: Vec<_> = plan.frames().iter()
            .map(|frame| frame.iter().map(|datagram| datagram.range.clone()).collect::<Vec<_>>())
            .collect();
        assert_eq!(ranges, [vec![0 .. 988], vec![988 .. 1800]]);
        assert_eq!(plan.frames()[0][0].expected, 3);
        assert_eq!(plan.frames()[1][0].expected, 1 + 2);

        // small datagrams share frames
        let layout = image_layout(&[(10, 10), (0, 0), (10, 10)]);
        let plan = Scheduler::plan(&layout, &[(1, Operational), (3, Operational)], 1000).unwrap();
        assert_eq!(plan.frames().len(), 1);
        assert_eq!(plan.frames()[0].len(), 1);

        assert!(Scheduler::plan(&layout, &active, PDU_HEADER).is_err());
    }

    #[tokio::test]
    async fn stale_image_on_deficit() {
        let bus = SimulatedBus::new(vec![
            SimulatedSlave::new(2, 1).with_process_data(2, 2),
            SimulatedSlave::new(2, 2).with_process_data(1, 3),
            ]);
        let mut raw = RawMaster::new(bus.clone(), Duration::from_millis(5));
        let config = MasterConfig {al_timeout_ms: 100, al_poll_us: 100, .. Default::default()};
        let topology = Topology::scan(&mut raw, &config).unwrap();
        let layout = ImageLayout::build(&topology, &config);
        let mut active = Vec::new();
        for slave in topology.iter() {
            let region = layout.region(slave.station).unwrap();
            let mut machine = SlaveStateMachine::new(slave.station, true);
            let (write, read) = slave.mailbox.unwrap();
            crate::mailbox::Mailbox::new(slave.station, write, read).configure(&mut raw).unwrap();
            machine.mailbox_configured();
            region.configure(&mut raw, layout.start()).unwrap();
            machine.validate_mapping(slave.declared(), region.mapped()).unwrap();
            machine.switch(&mut raw, Operational, &config).await.unwrap();
            active.push((slave.station, machine.state()));
        }
        let image = ProcessImage::new(layout);
        let mut plan = Scheduler::plan(image.layout(), &active, raw.frame_capacity()).unwrap();
        assert_eq!(plan.expected(), 6);

        bus.set_inputs(0, &[1, 2]);
        bus.set_inputs(1, &[3, 4, 5]);
        image.set_outputs(1, &[6, 7]).unwrap();
        assert_eq!(plan.exchange(&mut raw, &image).unwrap(), 6);
        assert_eq!(image.inputs(1).unwrap(), [1, 2]);
        assert_eq!(image.inputs(2).unwrap(), [3, 4, 5]);
        assert_eq!(bus.outputs(0), [6, 7]);

        // one slave stops answering, the image keeps the last complete inputs
        let before = image.snapshot();
        bus.set_inputs(0, &[9, 9]);
        bus.disconnect(1);
        assert!(matches!(
            plan.exchange(&mut raw, &image),
            Err(EthercatError::PartialCycleFailure {expected: 6, answered: 3}),
            ));
        assert_eq!(image.snapshot(), before);
        // both slaves share the datagram, exchanged alone only the missing one falls short
        assert_eq!(plan.suspects(), [1, 2]);
        assert_eq!(plan.isolate(&mut raw, &image, &plan.suspects()).unwrap(), [2]);
        assert_eq!(image.snapshot(), before);

        bus.drop_frames(1);
        assert!(matches!(
            plan.exchange(&mut raw, &image),
            Err(EthercatError::PartialCycleFailure {expected: 6, answered: 0}),
            ));
        assert_eq!(image.snapshot(), before);

        // without the missing slave, the others go on
        let mut plan = Scheduler::plan(image.layout(), &active[.. 1], raw.frame_capacity()).unwrap();
        assert_eq!(plan.exchange(&mut raw, &image).unwrap(), 3);
        assert_eq!(image.inputs(1).unwrap(), [9, 9]);
        assert_eq!(image.inputs(2).unwrap(), [3, 4, 5]);
    }
}

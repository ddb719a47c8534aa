/*!
    This module provides the layout of the process image and the shared buffer holding it.

    The process image is one contiguous slice of logical memory where each slave's process data is mapped by its FMMUs. For each slave, its outputs (written by the master) are followed by its inputs (read by the master):

    ```text
    logical_start
    |  slave 1          |  slave 2                  | ...
    |outputs |inputs    |outputs     |inputs        |
    ```

    - [ImageLayout] computes the offsets of each slave in the image and writes the corresponding sync manager and FMMU setup to the slaves
    - [ProcessImage] holds the image content, it is shared between the cyclic exchange and the application

    Example

    ```ignore
    let layout = ImageLayout::build(&topology, &config);
    for region in layout.regions() {
        region.configure(&mut raw, layout.start())?;
    }
    let image = ProcessImage::new(layout);
    image.write_output::<u16>(1, 0, 0x0f)?;
    // after a cycle
    let position = image.read_input::<i32>(2, 4)?;
    ```
*/

use core::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};
use crate::{
    rawmaster::RawMaster,
    registers::{self, FmmuEntry, SyncManagerChannel, SyncMode, SyncDirection},
    mailbox::Buffer,
    topology::Topology,
    slave::ProcessSizes,
    config::MasterConfig,
    data::{PduData, Field},
    error::{EthercatError, EthercatResult},
    };


/// FMMU entry used for the outputs of a slave
const FMMU_OUTPUTS: u8 = 0;
/// FMMU entry used for the inputs of a slave
const FMMU_INPUTS: u8 = 1;


/// place of one slave's process data in the image and in its physical memory
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SlaveRegion {
    /// station address
    pub station: u16,
    /// byte range of the outputs in the image
    pub outputs: Range<usize>,
    /// byte range of the inputs in the image
    pub inputs: Range<usize>,
    /// physical buffer of the outputs, with the mapped size
    pub output_buffer: Buffer,
    /// physical buffer of the inputs, with the mapped size
    pub input_buffer: Buffer,
}

impl SlaveRegion {
    /// byte range of the whole slave's data in the image
    pub fn range(&self) -> Range<usize> {
        self.outputs.start .. self.inputs.end
    }
    /// mapped sizes (outputs, inputs)
    pub fn mapped(&self) -> ProcessSizes {
        (self.output_buffer.size, self.input_buffer.size)
    }

    /**
        write the sync managers 2 and 3 and the FMMU entries mapping this region

        The slave must be in [registers::AlState::PreOperational] or lower, and `start` is the logical address of the image.
    */
    pub fn configure(&self, raw: &mut RawMaster, start: u32) -> EthercatResult {
        let interface = registers::sync_manager::interface;
        for (channel, fmmu, buffer, range, direction) in [
                (interface.outputs(), FMMU_OUTPUTS, self.output_buffer, &self.outputs, SyncDirection::Write),
                (interface.inputs(), FMMU_INPUTS, self.input_buffer, &self.inputs, SyncDirection::Read),
                ] {
            let (channel_config, fmmu_config) = if buffer.size == 0 {
                (SyncManagerChannel::disabled(), FmmuEntry::disabled())
            }
            else {
                let logical = u32::try_from(range.start).ok()
                    .and_then(|offset| start.checked_add(offset))
                    .ok_or(EthercatError::Master("process image exceeds the logical memory"))?;
                (
                    SyncManagerChannel::configured(buffer.address, buffer.size, SyncMode::Buffered, direction),
                    FmmuEntry::mapping(logical, buffer.size, buffer.address, direction),
                )
            };
            raw.fpwr(self.station, channel, channel_config)?.one()?;
            raw.fpwr(self.station, registers::fmmu.entry(fmmu), fmmu_config)?.one()?;
        }
        log::debug!("slave {} mapped at {:#x} + {:?}", self.station, start, self.range());
        Ok(())
    }
}

/// offsets of all the slaves' process data in the image
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImageLayout {
    /// logical address of the first byte of the image
    start: u32,
    regions: Vec<SlaveRegion>,
    /// total byte size
    size: usize,
}

impl ImageLayout {
    pub fn new(start: u32) -> Self {
        Self {start, regions: Vec::new(), size: 0}
    }
    /// append a slave's process data to the image
    pub fn push(&mut self, station: u16, outputs: Buffer, inputs: Buffer) -> &SlaveRegion {
        let output_start = self.size;
        let input_start = output_start + usize::from(outputs.size);
        self.size = input_start + usize::from(inputs.size);
        self.regions.push(SlaveRegion {
            station,
            outputs: output_start .. input_start,
            inputs: input_start .. self.size,
            output_buffer: outputs,
            input_buffer: inputs,
        });
        &self.regions[self.regions.len() - 1]
    }
    /**
        layout of all slaves of the topology, in position order

        The sizes declared in the EEPROM are used unless the slave configuration overrides them.
    */
    pub fn build(topology: &Topology, config: &MasterConfig) -> Self {
        let mut layout = Self::new(config.logical_start);
        for slave in topology.iter() {
            let (mut outputs, mut inputs) = (slave.outputs, slave.inputs);
            if let Some(overrides) = config.slave(slave.position) {
                outputs.size = overrides.outputs.unwrap_or(outputs.size);
                inputs.size = overrides.inputs.unwrap_or(inputs.size);
            }
            layout.push(slave.station, outputs, inputs);
        }
        layout
    }

    pub fn start(&self) -> u32  {self.start}
    pub fn size(&self) -> usize  {self.size}
    pub fn regions(&self) -> &[SlaveRegion]  {&self.regions}
    pub fn region(&self, station: u16) -> Option<&SlaveRegion> {
        self.regions.iter().find(|region| region.station == station)
    }
}

/**
    content of the process image, shared between the cyclic exchange and the application

    Clones share the same buffer. Every access copies in or out of the buffer under a lock, which is also held by the cyclic exchange while it reads the outputs and writes the inputs, so an access never sees half a cycle.
*/
#[derive(Clone, Debug)]
pub struct ProcessImage {
    layout: Arc<ImageLayout>,
    data: Arc<Mutex<Vec<u8>>>,
}

impl ProcessImage {
    /// zeroed image with the given layout
    pub fn new(layout: ImageLayout) -> Self {
        let data = vec![0; layout.size()];
        Self {
            layout: Arc::new(layout),
            data: Arc::new(Mutex::new(data)),
        }
    }
    pub fn layout(&self) -> &ImageLayout  {&self.layout}

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
    fn region(&self, station: u16) -> EthercatResult<&SlaveRegion> {
        self.layout.region(station)
            .ok_or(EthercatError::Master("slave has no region in the process image"))
    }

    /// copy of the whole image
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().clone()
    }
    /// copy of the inputs of a slave
    pub fn inputs(&self, station: u16) -> EthercatResult<Vec<u8>> {
        let range = self.region(station)?.inputs.clone();
        Ok(self.lock()[range].to_vec())
    }
    /// copy of the outputs of a slave
    pub fn outputs(&self, station: u16) -> EthercatResult<Vec<u8>> {
        let range = self.region(station)?.outputs.clone();
        Ok(self.lock()[range].to_vec())
    }
    /// replace the outputs of a slave, `data` must have the mapped size
    pub fn set_outputs(&self, station: u16, data: &[u8]) -> EthercatResult {
        let range = self.region(station)?.outputs.clone();
        if data.len() != range.len()
            {return Err(EthercatError::Master("outputs size does not match the mapping"))}
        self.lock()[range].copy_from_slice(data);
        Ok(())
    }

    /// read a value at the given byte offset in the inputs of a slave
    pub fn read_input<T: PduData>(&self, station: u16, offset: usize) -> EthercatResult<T> {
        let field = located::<T>(&self.region(station)?.inputs, offset)?;
        Ok(field.get(&self.lock())?)
    }
    /// read back a value at the given byte offset in the outputs of a slave
    pub fn read_output<T: PduData>(&self, station: u16, offset: usize) -> EthercatResult<T> {
        let field = located::<T>(&self.region(station)?.outputs, offset)?;
        Ok(field.get(&self.lock())?)
    }
    /// write a value at the given byte offset in the outputs of a slave, it is sent at the next cycle
    pub fn write_output<T: PduData>(&self, station: u16, offset: usize, value: T) -> EthercatResult {
        let field = located::<T>(&self.region(station)?.outputs, offset)?;
        Ok(field.set(&mut self.lock(), value)?)
    }

    /// copy the inputs of the given slaves from the received image
    pub(crate) fn commit_inputs(&self, received: &[u8], stations: &[u16]) {
        let mut data = self.lock();
        for region in self.layout.regions().iter().filter(|region| stations.contains(&region.station)) {
            if let Some(source) = received.get(region.inputs.clone()) {
                data[region.inputs.clone()].copy_from_slice(source);
            }
        }
    }
}

/// field of a `T` at `offset` in the given region of the image
fn located<T: PduData>(region: &Range<usize>, offset: usize) -> EthercatResult<Field<T>> {
    let field = Field::<T>::simple(region.start + offset);
    if field.range().end > region.end
        {return Err(EthercatError::Master("value exceeds the slave's region"))}
    Ok(field)
}


#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use crate::socket::{SimulatedBus, SimulatedSlave};
    use crate::config::SlaveConfig;

    #[test]
    fn contiguous_layout() {
        let mut layout = ImageLayout::new(0x1000);
        layout.push(1, Buffer {address: 0x1100, size: 2}, Buffer {address: 0x1180, size: 6});
        layout.push(2, Buffer {address: 0x1100, size: 0}, Buffer {address: 0x1180, size: 0});
        layout.push(3, Buffer {address: 0x1100, size: 4}, Buffer {address: 0x1180, size: 0});
        assert_eq!(layout.size(), 12);

        let first = layout.region(1).unwrap();
        assert_eq!((first.outputs.clone(), first.inputs.clone()), (0 .. 2, 2 .. 8));
        assert_eq!(layout.region(2).unwrap().range(), 8 .. 8);
        let last = layout.region(3).unwrap();
        assert_eq!((last.outputs.clone(), last.inputs.clone()), (8 .. 12, 12 .. 12));
        assert_eq!(last.mapped(), (4, 0));
        assert!(layout.region(4).is_none());
    }

    #[test]
    fn application_access() {
        let mut layout = ImageLayout::new(0);
        layout.push(1, Buffer {address: 0x1100, size: 4}, Buffer {address: 0x1180, size: 4});
        let image = ProcessImage::new(layout);
        let shared = image.clone();

        shared.write_output::<u16>(1, 2, 0x1234).unwrap();
        assert_eq!(image.outputs(1).unwrap(), [0, 0, 0x34, 0x12]);
        assert_eq!(image.read_output::<u16>(1, 2).unwrap(), 0x1234);
        assert!(image.write_output::<u32>(1, 2, 0).is_err());
        assert!(image.read_input::<u32>(2, 0).is_err());
        assert!(image.set_outputs(1, &[1, 2]).is_err());

        image.commit_inputs(&[9, 9, 9, 9, 1, 0, 0, 0], &[1]);
        assert_eq!(shared.read_input::<u32>(1, 0).unwrap(), 1);
        // outputs are left untouched by the received image
        assert_eq!(shared.snapshot(), [0, 0, 0x34, 0x12, 1, 0, 0, 0]);
        image.commit_inputs(&[0; 8], &[]);
        assert_eq!(shared.inputs(1).unwrap(), [1, 0, 0, 0]);
    }

    #[test]
    fn slave_setup() {
        let bus = SimulatedBus::new(vec![
            SimulatedSlave::new(2, 1).with_process_data(2, 4),
            SimulatedSlave::new(2, 2).with_process_data(0, 2).without_mailbox(),
            ]);
        let mut raw = RawMaster::new(bus.clone(), Duration::from_millis(10));
        let config = MasterConfig {
            logical_start: 0x2000,
            slaves: vec![SlaveConfig {position: 0, inputs: Some(3), .. Default::default()}],
            .. Default::default()
        };
        let topology = Topology::scan(&mut raw, &config).unwrap();
        let layout = ImageLayout::build(&topology, &config);
        assert_eq!(layout.size(), 7);
        assert_eq!(layout.region(1).unwrap().mapped(), (2, 3));
        assert_eq!(layout.region(2).unwrap().inputs, 5 .. 7);

        for region in layout.regions() {
            region.configure(&mut raw, layout.start()).unwrap();
        }
        let entry = raw.fprd(2, registers::fmmu.entry(FMMU_INPUTS)).unwrap().one().unwrap();
        assert_eq!(entry.logical_start_byte(), 0x2005);
        assert_eq!(entry.logical_len_byte(), 2);
        assert!(entry.read() && entry.enable());
        let outputs = raw.fprd(2, registers::fmmu.entry(FMMU_OUTPUTS)).unwrap().one().unwrap();
        assert!(! outputs.enable());
        let channel = raw.fprd(1, registers::sync_manager::interface.inputs()).unwrap().one().unwrap();
        assert_eq!((channel.address(), channel.length()), (0x1180, 3));
    }
}

/*!
    discovery of the slaves present on the segment

    Slaves are found by their position: an auto-incremented read of the first register is answered by the slave at the probed position only, so probing positions `0, 1, 2, ...` until nobody answers gives the number of slaves without knowing it in advance. Each slave found is given the station address `position + 1`, then its EEPROM is read to build its [SlaveDescriptor].
*/

use crate::{
    rawmaster::RawMaster,
    frame::PduCommand,
    registers::{self, AlControl, AlState},
    mailbox::Buffer,
    sii::{Sii, Identity, MailboxTypes},
    slave::ProcessSizes,
    config::{MasterConfig, SlaveConfig},
    error::{EthercatError, EthercatResult},
    };


/// byte size of the FMMU registers of all entries
const FMMU_REGISTERS: usize = 16 * 0x10;
/// byte size of the sync manager registers of all channels
const SYNC_MANAGER_REGISTERS: usize = 16 * 8;


/// what is known about a slave after the scan
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SlaveDescriptor {
    /// position on the segment, starting at 0
    pub position: u16,
    /// station address assigned during the scan
    pub station: u16,
    pub identity: Identity,
    /// device name from the EEPROM, or from the slave configuration
    pub name: String,
    pub protocols: MailboxTypes,
    /// (write, read) buffers of the mailbox, if the slave has one
    pub mailbox: Option<(Buffer, Buffer)>,
    /// declared buffer of the process data written by the master
    pub outputs: Buffer,
    /// declared buffer of the process data read by the master
    pub inputs: Buffer,
    /// state reported by the slave when scanned
    pub state: AlState,
}

impl SlaveDescriptor {
    /// process data sizes declared by the slave
    pub fn declared(&self) -> ProcessSizes {
        (self.outputs.size, self.inputs.size)
    }
    /// true if the slave can serve SDO requests in its mailbox
    pub fn supports_coe(&self) -> bool {
        self.mailbox.is_some() && self.protocols.can()
    }
    /// true if the identity matches the expectations of the given slave configuration
    pub fn matches(&self, config: &SlaveConfig) -> bool {
        config.vendor.map_or(true, |vendor| vendor == self.identity.vendor)
        && config.product.map_or(true, |product| product == self.identity.product)
    }
}

/**
    directory of the slaves on the segment, in position order

    It is only built by a scan: rebuilding it invalidates any process image built from the previous one.
*/
#[derive(Clone, Debug, Default)]
pub struct Topology {
    slaves: Vec<SlaveDescriptor>,
}

impl Topology {
    /**
        bring all slaves back to [AlState::Init] and clear their FMMU and sync manager setup

        This is done with broadcast commands, so it works whatever the station addresses are.
    */
    pub fn reset(raw: &mut RawMaster) -> EthercatResult {
        raw.bwr(registers::al::control, AlControl::request(AlState::Init, true))?;
        raw.pdu(PduCommand::BWR, 0, registers::fmmu.address, &mut [0; FMMU_REGISTERS])?;
        raw.pdu(PduCommand::BWR, 0, registers::sync_manager::interface.address, &mut [0; SYNC_MANAGER_REGISTERS])?;
        Ok(())
    }

    /**
        find the slaves on the segment, assign their station addresses and read their EEPROM

        A probe answered by no slave ends the scan. A probe that is lost or answered by several slaves is retried up to [MasterConfig::scan_retries] times, and so is the addressing and EEPROM reading of each slave found. Exhausting the retries gives [EthercatError::TopologyScanFailed].
    */
    pub fn scan(raw: &mut RawMaster, config: &MasterConfig) -> EthercatResult<Self> {
        let mut slaves = Vec::new();
        for position in 0 .. config.max_slaves {
            if ! probe(raw, position, config.scan_retries)?
                {break}
            slaves.push(retry(position, config.scan_retries, || describe(raw, position, config))?);
        }
        if slaves.len() == usize::from(config.max_slaves) {
            log::warn!("scan stopped at the maximum of {} slaves", config.max_slaves);
        }
        log::info!("found {} slaves", slaves.len());
        Ok(Self {slaves})
    }

    /// number of slaves currently answering on the segment, without changing their setup
    pub fn count(raw: &mut RawMaster, config: &MasterConfig) -> EthercatResult<u16> {
        let mut count = 0;
        while count < config.max_slaves && probe(raw, count, config.scan_retries)? {
            count += 1;
        }
        Ok(count)
    }

    pub fn len(&self) -> usize  {self.slaves.len()}
    pub fn is_empty(&self) -> bool  {self.slaves.is_empty()}
    /// all slaves in position order
    pub fn slaves(&self) -> &[SlaveDescriptor]  {&self.slaves}
    pub fn iter(&self) -> impl Iterator<Item=&SlaveDescriptor>  {self.slaves.iter()}

    pub fn by_station(&self, station: u16) -> Option<&SlaveDescriptor> {
        self.slaves.iter().find(|slave| slave.station == station)
    }
    pub fn by_position(&self, position: u16) -> Option<&SlaveDescriptor> {
        self.slaves.get(usize::from(position))
    }
    /// first slave with the given name
    pub fn by_name(&self, name: &str) -> Option<&SlaveDescriptor> {
        self.slaves.iter().find(|slave| slave.name == name)
    }
}

/// true if a slave exists at the given position
fn probe(raw: &mut RawMaster, position: u16, retries: usize) -> EthercatResult<bool> {
    retry(position, retries, || {
        let answers = raw.aprd(position, registers::controller_type)?.answers;
        match answers {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(EthercatError::WorkingCounter {expected: 1, answered: answers}),
        }
    })
}

/// give the slave at `position` its station address and read its description
fn describe(raw: &mut RawMaster, position: u16, config: &MasterConfig) -> EthercatResult<SlaveDescriptor> {
    let station = position + 1;
    raw.apwr(position, registers::address::fixed, station)?.one()?;
    let info = Sii::new(raw, station, config.sii_timeout()).information()?;
    let state = raw.fprd(station, registers::al::status)?.one()?
        .al_state()
        .ok_or(EthercatError::Protocol("undefined slave state"))?;
    let name = config.slave(position)
        .and_then(|slave| slave.name.clone())
        .unwrap_or(info.name);
    log::debug!("slave {} at position {}: {:?} {:?} in {}", station, position, name, info.identity, state);
    Ok(SlaveDescriptor {
        position,
        station,
        identity: info.identity,
        name,
        protocols: info.protocols,
        mailbox: info.mailbox,
        outputs: info.outputs,
        inputs: info.inputs,
        state,
    })
}

/// run `task` until it succeeds, at most `retries + 1` times. Socket errors are not retried
fn retry<T>(position: u16, retries: usize, mut task: impl FnMut() -> EthercatResult<T>) -> EthercatResult<T> {
    for attempt in 0 ..= retries {
        match task() {
            Ok(value) => return Ok(value),
            Err(EthercatError::Io(err)) => return Err(EthercatError::Io(err)),
            Err(err) => log::debug!("scan at position {} failed (attempt {}): {}", position, attempt, err),
        }
    }
    log::error!("scan failed at position {}", position);
    Err(EthercatError::TopologyScanFailed {position})
}


#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use std::{
        io,
        sync::atomic::{AtomicUsize, Ordering},
        };
    use crate::socket::{EthercatSocket, SimulatedBus, SimulatedSlave};

    fn segment() -> SimulatedBus {
        SimulatedBus::new(vec![
            SimulatedSlave::new(2, 0x044c2c52).with_name("EK1100"),
            SimulatedSlave::new(2, 0x07d83052).with_name("EL2008").with_process_data(1, 0).without_mailbox(),
            SimulatedSlave::new(0x9a, 0x1234).with_name("drive").with_process_data(12, 16).with_serial(3, 42),
            ])
    }

    #[test]
    fn addresses_in_position_order() {
        let bus = segment();
        let mut raw = RawMaster::new(bus.clone(), Duration::from_millis(10));
        Topology::reset(&mut raw).unwrap();
        let topology = Topology::scan(&mut raw, &MasterConfig::default()).unwrap();

        assert_eq!(topology.len(), 3);
        assert_eq!(bus.probes(), 4);
        for (position, slave) in topology.iter().enumerate() {
            assert_eq!(usize::from(slave.position), position);
            assert_eq!(usize::from(slave.station), position + 1);
            assert_eq!(bus.station(position), Some(slave.station));
            assert_eq!(slave.state, AlState::Init);
        }
        let drive = topology.by_name("drive").unwrap();
        assert_eq!(drive.station, 3);
        assert_eq!(drive.identity, Identity {vendor: 0x9a, product: 0x1234, revision: 3, serial: 42});
        assert_eq!(drive.declared(), (12, 16));
        assert!(drive.supports_coe());
        let digital = topology.by_station(2).unwrap();
        assert_eq!(digital.mailbox, None);
        assert!(! digital.supports_coe());
        assert_eq!(topology.by_position(0).unwrap().name, "EK1100");

        assert_eq!(Topology::count(&mut raw, &MasterConfig::default()).unwrap(), 3);
        bus.disconnect(1);
        assert_eq!(Topology::count(&mut raw, &MasterConfig::default()).unwrap(), 2);
    }

    #[test]
    fn configured_names_and_limits() {
        let bus = segment();
        let mut raw = RawMaster::new(bus.clone(), Duration::from_millis(10));
        let config = MasterConfig {
            max_slaves: 2,
            slaves: vec![SlaveConfig {position: 1, name: Some("outputs".into()), vendor: Some(3), .. Default::default()}],
            .. Default::default()
        };
        let topology = Topology::scan(&mut raw, &config).unwrap();
        assert_eq!(topology.len(), 2);
        let slave = topology.by_name("outputs").unwrap();
        assert_eq!(slave.position, 1);
        assert!(! slave.matches(&config.slaves[0]));
        assert!(slave.matches(&SlaveConfig {vendor: Some(2), .. Default::default()}));
    }

    #[test]
    fn empty_segment() {
        let bus = SimulatedBus::new(Vec::new());
        let mut raw = RawMaster::new(bus.clone(), Duration::from_millis(10));
        let topology = Topology::scan(&mut raw, &MasterConfig::default()).unwrap();
        assert!(topology.is_empty());
        assert_eq!(bus.probes(), 1);
    }

    /// socket losing the frames at the given sending ranks
    struct Lossy {
        bus: SimulatedBus,
        sent: AtomicUsize,
        lost: Vec<usize>,
    }
    impl EthercatSocket for Lossy {
        fn receive(&self, data: &mut [u8], timeout: Duration) -> io::Result<usize> {
            self.bus.receive(data, timeout)
        }
        fn send(&self, data: &[u8]) -> io::Result<()> {
            if self.lost.contains(&self.sent.fetch_add(1, Ordering::Relaxed))
                {return Ok(())}
            self.bus.send(data)
        }
        fn max_frame(&self) -> usize  {self.bus.max_frame()}
    }

    #[test]
    fn lost_after_probe() {
        let config = MasterConfig {scan_retries: 3, .. Default::default()};

        // the station address assignment of the first slave is lost
        let bus = segment();
        let mut raw = RawMaster::new(Lossy {bus: bus.clone(), sent: AtomicUsize::new(0), lost: vec![1]}, Duration::from_millis(1));
        let topology = Topology::scan(&mut raw, &config).unwrap();
        assert_eq!(topology.len(), 3);
        assert_eq!(bus.station(0), Some(1));
        assert_eq!(topology.by_position(0).unwrap().name, "EK1100");

        // every attempt at describing the first slave is lost
        let mut raw = RawMaster::new(Lossy {bus: segment(), sent: AtomicUsize::new(0), lost: (1 ..= 4).collect()}, Duration::from_millis(1));
        assert!(matches!(
            Topology::scan(&mut raw, &config),
            Err(EthercatError::TopologyScanFailed {position: 0}),
            ));
    }

    #[test]
    fn lost_probes() {
        let bus = segment();
        let mut raw = RawMaster::new(bus.clone(), Duration::from_millis(1));
        let config = MasterConfig {scan_retries: 2, .. Default::default()};

        bus.drop_frames(2);
        assert_eq!(Topology::scan(&mut raw, &config).unwrap().len(), 3);

        bus.drop_frames(3);
        assert!(matches!(
            Topology::scan(&mut raw, &config),
            Err(EthercatError::TopologyScanFailed {position: 0}),
            ));
    }
}

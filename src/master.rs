/*!
    the master session: bring-up of the segment, cyclic exchange, and fault containment

    [Master] owns the bus and everything built on top of it: the topology, the state machine of every slave, the process image and its exchange plan, and the SDO engine. It is the only component requesting AL state transitions and changing the set of slaves taking part in the process data exchange.
*/

use core::future::Future;
use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    sync::Arc,
    time::Instant,
    };
use tokio::sync::broadcast;
use crate::{
    socket::EthercatSocket,
    rawmaster::RawMaster,
    frame::{Frame, Pdu, PduCommand, PDU_HEADER, PDU_FOOTER},
    registers::{self, AlError, AlState},
    data::PduData,
    sii::Identity,
    topology::{Topology, SlaveDescriptor},
    slave::{SlaveStateMachine, ProcessSizes},
    mailbox::Mailbox,
    sdo::{Sdo, SdoClient, SdoEngine, TransactionHandle, TransactionResult},
    mapping::{ImageLayout, ProcessImage},
    scheduler::Scheduler,
    config::MasterConfig,
    error::{EthercatError, EthercatResult},
    };


/// number of events kept for slow subscribers
const EVENTS_CAPACITY: usize = 256;


/// what happened on the segment, delivered to [Master::subscribe]rs
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// the segment has been scanned
    ScanComplete {slaves: usize},
    /// a slave confirmed a new state
    StateChanged {slave: u16, state: AlState},
    /// a slave did not answer or did not confirm a request
    Unresponsive {slave: u16},
    /// the process data mapped for a slave does not match its declaration, it stays out of the exchange
    MappingMismatch {slave: u16, declared: ProcessSizes, mapped: ProcessSizes},
    /// a slave is not the device configured at its position, it is left in INIT
    IdentityMismatch {slave: u16, identity: Identity},
    /// a cycle did not complete, the process image kept its previous inputs
    PartialCycleFailure {expected: u16, answered: u16},
    /// a slave has been requested a lower state and removed from the exchange
    Demoted {slave: u16, state: AlState},
    /// the number of slaves answering differs from the scan, the bring-up must be done again
    TopologyChanged {expected: u16, found: u16},
    /// no frame came back for too long
    MediumLost,
}

/// moments of the cycle where callbacks can be registered
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Hook {
    /// before the outputs are sent
    ExchangeStart,
    /// after the exchange, whether it completed or not
    ExchangeComplete,
}

type Callback = Box<dyn FnMut(&ProcessImage) + Send>;

/// state of a slave as seen by the master
#[derive(Clone, Debug)]
pub struct SlaveStatus {
    pub descriptor: SlaveDescriptor,
    /// last state reported by the slave, or the state of an acknowledged demotion
    pub state: AlState,
    /// last state requested by the master
    pub requested: AlState,
    /// true if the slave takes part in the process data exchange
    pub exchanging: bool,
    pub unresponsive: bool,
}

/**
    session on an ethercat segment, from bring-up to shutdown

    ## Example

    ```ignore
    let mut master = Master::new(EthernetSocket::new("eno1")?, MasterConfig::from_yaml("bus.yaml")?);
    let mut events = master.subscribe();
    master.bring_up().await?;

    let image = master.image();
    master.on(Hook::ExchangeStart, move |image| {
        image.write_output::<u16>(1, 0, 0x0f).ok();
    });
    master.run(tokio::signal::ctrl_c()).await?;
    master.shutdown().await?;
    ```
*/
pub struct Master {
    raw: RawMaster,
    config: MasterConfig,
    topology: Topology,
    /// state machines by station address
    slaves: BTreeMap<u16, SlaveStateMachine>,
    /// slaves kept out of the exchange whatever their state
    excluded: BTreeSet<u16>,
    /// consecutive failed cycles by station address
    failures: BTreeMap<u16, usize>,
    image: ProcessImage,
    scheduler: Scheduler,
    sdo: SdoEngine,
    events: broadcast::Sender<Event>,
    hooks: Vec<(Hook, Callback)>,
    /// a failed cycle suggested a topology change
    rescan: bool,
    medium_lost: bool,
}

impl Master {
    /// session on the given socket, nothing is sent before [Self::bring_up]
    pub fn new<S: EthercatSocket + 'static + Send + Sync>(socket: S, config: MasterConfig) -> Self {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        Self {
            raw: RawMaster::new(socket, config.response_timeout()),
            sdo: SdoEngine::new(config.mailbox_timeout(), config.mailbox_retries),
            config,
            topology: Topology::default(),
            slaves: BTreeMap::new(),
            excluded: BTreeSet::new(),
            failures: BTreeMap::new(),
            image: ProcessImage::new(ImageLayout::default()),
            scheduler: Scheduler::default(),
            events,
            hooks: Vec::new(),
            rescan: false,
            medium_lost: false,
        }
    }

    pub fn config(&self) -> &MasterConfig  {&self.config}
    pub fn topology(&self) -> &Topology  {&self.topology}
    /// shared handle on the process image, valid until the next bring-up
    pub fn image(&self) -> ProcessImage  {self.image.clone()}
    /// handle to submit SDO transactions from any task, they progress in [Self::maintenance]
    pub fn sdo_client(&self) -> SdoClient  {self.sdo.client()}
    /// plan of the current process data exchange
    pub fn scheduler(&self) -> &Scheduler  {&self.scheduler}

    /// receive the events happening from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
    fn emit(&self, event: Event) {
        log::debug!("event {:?}", event);
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    /// register a callback called at the given moment of every cycle
    pub fn on(&mut self, hook: Hook, callback: impl FnMut(&ProcessImage) + Send + 'static) {
        self.hooks.push((hook, Box::new(callback)));
    }
    fn call(&mut self, hook: Hook) {
        for (moment, callback) in self.hooks.iter_mut() {
            if *moment == hook {
                callback(&self.image);
            }
        }
    }

    /**
        scan the segment and bring every slave to the configured target state

        The steps are done for all slaves before the next one begins: scan and address assignment, identity check, mailbox setup, PREOP, process image layout and mapping validation, SAFEOP, OP.

        A slave failing a step is left out of the following steps and reported in the events, the others go on. Only a failed scan or a transport error aborts the bring-up.

        Frames are exchanged synchronously through [RawMaster], each one blocking the calling thread for up to the response timeout. Only the waits between AL status polls yield to the executor, so the master should get its own thread or a current-thread runtime.
    */
    pub async fn bring_up(&mut self) -> EthercatResult {
        self.sdo.clear();
        self.slaves.clear();
        self.excluded.clear();
        self.failures.clear();
        self.scheduler = Scheduler::default();
        self.image = ProcessImage::new(ImageLayout::default());
        self.rescan = false;

        Topology::reset(&mut self.raw)?;
        self.topology = Topology::scan(&mut self.raw, &self.config)?;
        self.emit(Event::ScanComplete {slaves: self.topology.len()});

        for slave in self.topology.slaves() {
            self.slaves.insert(slave.station, SlaveStateMachine::new(slave.station, slave.mailbox.is_some()));
        }
        self.check_identities();
        self.configure_mailboxes()?;

        self.bring_all(AlState::PreOperational).await?;
        for slave in self.topology.slaves() {
            if let (Some((write, read)), true) = (slave.mailbox, slave.supports_coe()) {
                if self.state(slave.station) == Some(AlState::PreOperational) {
                    self.sdo.add_slave(Mailbox::new(slave.station, write, read));
                }
            }
        }
        if self.config.target_state.rank() < AlState::SafeOperational.rank() {
            return Ok(())
        }

        self.configure_mapping()?;
        self.bring_all(AlState::SafeOperational).await?;
        self.replan()?;
        if self.config.target_state == AlState::Operational {
            // slaves expect valid outputs before entering OP
            if let Err(err) = self.scheduler.exchange(&mut self.raw, &self.image) {
                log::debug!("first exchange in SAFEOP: {}", err);
            }
            self.bring_all(AlState::Operational).await?;
            self.replan()?;
        }
        log::info!("bring-up done, {} of {} slaves exchanging", self.scheduler.active().len(), self.topology.len());
        Ok(())
    }

    fn check_identities(&mut self) {
        for slave in self.topology.slaves() {
            let Some(expected) = self.config.slave(slave.position)
                else {continue};
            if ! slave.matches(expected) {
                log::error!("slave {} is {:?}, expected vendor {:?} product {:?}",
                    slave.station, slave.identity, expected.vendor, expected.product);
                self.excluded.insert(slave.station);
                self.emit(Event::IdentityMismatch {slave: slave.station, identity: slave.identity});
            }
        }
    }

    fn configure_mailboxes(&mut self) -> EthercatResult {
        for slave in self.topology.slaves() {
            let Some((write, read)) = slave.mailbox
                else {continue};
            if self.excluded.contains(&slave.station)
                {continue}
            match Mailbox::new(slave.station, write, read).configure(&mut self.raw) {
                Ok(()) => if let Some(machine) = self.slaves.get_mut(&slave.station) {
                    machine.mailbox_configured();
                },
                Err(EthercatError::Io(err)) => return Err(EthercatError::Io(err)),
                Err(err) => {
                    log::warn!("cannot configure mailbox of slave {}: {}", slave.station, err);
                    self.excluded.insert(slave.station);
                    self.emit(Event::Unresponsive {slave: slave.station});
                },
            }
        }
        Ok(())
    }

    fn configure_mapping(&mut self) -> EthercatResult {
        let layout = ImageLayout::build(&self.topology, &self.config);
        for (slave, region) in self.topology.slaves().iter().zip(layout.regions()) {
            if self.excluded.contains(&slave.station)
                {continue}
            let Some(machine) = self.slaves.get_mut(&slave.station)
                else {continue};
            let configured = region.configure(&mut self.raw, layout.start())
                .and_then(|_| machine.validate_mapping(slave.declared(), region.mapped()));
            match configured {
                Ok(()) => {},
                Err(EthercatError::Io(err)) => return Err(EthercatError::Io(err)),
                Err(EthercatError::PdoMappingMismatch {slave, declared, mapped}) => {
                    log::error!("slave {} declares {:?} bytes of process data but {:?} are mapped", slave, declared, mapped);
                    self.excluded.insert(slave);
                    self.emit(Event::MappingMismatch {slave, declared, mapped});
                },
                Err(err) => {
                    log::warn!("cannot map slave {}: {}", slave.station, err);
                    self.excluded.insert(slave.station);
                    self.emit(Event::Unresponsive {slave: slave.station});
                },
            }
        }
        self.image = ProcessImage::new(layout);
        Ok(())
    }

    /// bring all slaves not excluded to the given state, excluding the ones failing
    async fn bring_all(&mut self, state: AlState) -> EthercatResult {
        let stations: Vec<u16> = self.slaves.keys()
            .filter(|station| ! self.excluded.contains(*station))
            .copied()
            .collect();
        for station in stations {
            match self.transition(station, state).await {
                Ok(()) => {},
                Err(EthercatError::Io(err)) => return Err(EthercatError::Io(err)),
                Err(err) => {
                    log::warn!("slave {} left out of the bring-up: {}", station, err);
                    self.excluded.insert(station);
                },
            }
        }
        Ok(())
    }

    /// switch one slave, reporting what happened in the events
    async fn transition(&mut self, station: u16, state: AlState) -> EthercatResult<(), AlError> {
        let machine = self.slaves.get_mut(&station)
            .ok_or(EthercatError::<AlError>::Master("no slave with this station address"))?;
        let before = machine.state();
        let result = machine.switch(&mut self.raw, state, &self.config).await;
        let after = machine.state();

        if after != before {
            self.emit(Event::StateChanged {slave: station, state: after});
        }
        match &result {
            Err(EthercatError::Unresponsive {slave}) =>
                self.emit(Event::Unresponsive {slave: *slave}),
            Err(EthercatError::PdoMappingMismatch {slave, declared, mapped}) =>
                self.emit(Event::MappingMismatch {slave: *slave, declared: *declared, mapped: *mapped}),
            _ => {},
        }
        result
    }

    /// recompute the exchange plan from the current states and exclusions
    fn replan(&mut self) -> EthercatResult {
        let active: Vec<(u16, AlState)> = self.slaves.values()
            .filter(|machine| ! self.excluded.contains(&machine.station()))
            .map(|machine| (machine.station(), machine.state()))
            .collect();
        self.scheduler = Scheduler::plan(self.image.layout(), &active, self.raw.frame_capacity())?;
        Ok(())
    }

    /**
        request a state for one slave, and wait for its confirmation

        The slave joins the process data exchange if it reaches a state exchanging process data with a validated mapping, and leaves it otherwise.
    */
    pub async fn request_state(&mut self, station: u16, state: AlState) -> EthercatResult<(), AlError> {
        let result = self.transition(station, state).await;
        let joins = self.slaves.get(&station)
            .map(|machine| machine.state().exchanges_process_data()
                && machine.mapping().map_or(false, |check| check.declared == check.mapped))
            .unwrap_or(false);
        if result.is_ok() && joins {
            self.excluded.remove(&station);
            self.failures.remove(&station);
        }
        else {
            self.excluded.insert(station);
        }
        self.replan()?;
        result
    }

    /**
        run one process data cycle

        A cycle never blocks on mailbox traffic. If it does not complete, the process image keeps the inputs of the last complete cycle, [Event::PartialCycleFailure] is emitted and [EthercatError::PartialCycleFailure] is returned. The slaves are then diagnosed, and the ones failing for [MasterConfig::cycle_failures_before_demote] cycles in a row are demoted to SAFEOP and removed from the exchange.

        Returns the working counter of the cycle.
    */
    pub fn cycle(&mut self) -> EthercatResult<u16> {
        self.call(Hook::ExchangeStart);
        let result = self.scheduler.exchange(&mut self.raw, &self.image);
        self.call(Hook::ExchangeComplete);
        match result {
            Ok(answered) => {
                self.failures.clear();
                self.medium_lost = false;
                Ok(answered)
            },
            Err(EthercatError::PartialCycleFailure {expected, answered}) => {
                self.emit(Event::PartialCycleFailure {expected, answered});
                if self.raw.lost_frames() >= self.config.lost_frames_before_medium_lost {
                    if ! self.medium_lost {
                        log::error!("no answer for {} frames, medium lost", self.raw.lost_frames());
                        self.medium_lost = true;
                        self.emit(Event::MediumLost);
                    }
                    return Err(EthercatError::Io(Arc::new(io::Error::new(io::ErrorKind::NotConnected, "ethercat medium lost"))));
                }
                self.diagnose()?;
                Err(EthercatError::PartialCycleFailure {expected, answered})
            },
            Err(err) => Err(err),
        }
    }

    /// find the slaves responsible for a failed cycle, and demote the ones failing for too long
    fn diagnose(&mut self) -> EthercatResult {
        let stations = self.scheduler.active().to_vec();
        let status = registers::al::status;
        let per_frame = (self.raw.frame_capacity() / (PDU_HEADER + status.len + PDU_FOOTER)).max(1);
        let mut explained = false;
        let mut healthy = Vec::new();

        for group in stations.chunks(per_frame) {
            let mut frame = Frame::with(group.iter()
                .map(|station| Pdu::new(PduCommand::FPRD, *station, status.byte as u16, vec![0; status.len]))
                .collect());
            match self.raw.transact(&mut frame) {
                Ok(()) => {},
                Err(EthercatError::Timeout(_)) => {
                    log::debug!("diagnosis frame lost");
                    self.rescan = true;
                    continue
                },
                Err(err) => return Err(err),
            }
            for (station, pdu) in group.iter().zip(frame.pdus.iter()) {
                let Some(machine) = self.slaves.get_mut(station)
                    else {continue};
                let reported = match pdu.working_count {
                    1 => registers::AlStatus::unpack(&pdu.data).ok().and_then(|status| status.al_state()),
                    _ => None,
                };
                let as_requested = match reported {
                    Some(state) => {
                        machine.observed(state);
                        state == machine.requested()
                    },
                    None => {
                        machine.missed();
                        self.rescan = true;
                        false
                    },
                };
                if as_requested {
                    healthy.push(*station);
                }
                else {
                    explained = true;
                    *self.failures.entry(*station).or_insert(0) += 1;
                }
            }
        }
        // a slave can report the right state and still not process its datagram
        let silent = if explained {Vec::new()} else {
            let suspects = self.scheduler.suspects();
            self.scheduler.isolate(&mut self.raw, &self.image, &suspects)?
        };
        if ! explained && silent.is_empty() {
            log::warn!("failed cycle not explained by any slave");
            self.rescan = true;
        }
        for station in healthy {
            if silent.contains(&station) {
                log::warn!("slave {} reports its state but does not process its datagram", station);
                *self.failures.entry(station).or_insert(0) += 1;
            }
            else {
                self.failures.remove(&station);
            }
        }

        let demoted: Vec<u16> = self.failures.iter()
            .filter(|(_, failures)| **failures >= self.config.cycle_failures_before_demote)
            .map(|(station, _)| *station)
            .collect();
        for station in demoted.iter() {
            self.demote(*station)?;
        }
        if ! demoted.is_empty() {
            self.replan()?;
        }
        Ok(())
    }

    fn demote(&mut self, station: u16) -> EthercatResult {
        self.failures.remove(&station);
        self.excluded.insert(station);
        let Some(machine) = self.slaves.get_mut(&station)
            else {return Ok(())};
        let target = AlState::SafeOperational;
        if machine.state().rank() > target.rank() {
            machine.demote(&mut self.raw, target)?;
        }
        let unresponsive = machine.is_unresponsive();
        log::warn!("slave {} removed from the exchange", station);
        if unresponsive {
            self.emit(Event::Unresponsive {slave: station});
        }
        self.emit(Event::Demoted {slave: station, state: target});
        Ok(())
    }

    /**
        non-realtime work to do between cycles, until the given deadline

        It progresses the SDO transactions, and checks the number of slaves when a failed cycle suggested a topology change. A changed topology is reported with [Event::TopologyChanged], the cyclic exchange goes on with the remaining slaves until [Self::bring_up] is called again.
    */
    pub fn maintenance(&mut self, deadline: Instant) -> EthercatResult {
        self.sdo.service(&mut self.raw, deadline);
        if self.rescan && Instant::now() < deadline {
            match Topology::count(&mut self.raw, &self.config) {
                Ok(found) => {
                    self.rescan = false;
                    let expected = u16::try_from(self.topology.len()).unwrap_or(u16::MAX);
                    if found != expected {
                        log::warn!("{} slaves answering instead of {}", found, expected);
                        self.emit(Event::TopologyChanged {expected, found});
                    }
                },
                Err(EthercatError::Io(err)) => return Err(EthercatError::Io(err)),
                Err(err) => log::debug!("topology check failed: {}", err),
            }
        }
        Ok(())
    }

    /**
        run cycles at the configured period until `stop` completes

        Each period runs one [Self::cycle] followed by [Self::maintenance] with the time left. Failed cycles are reported in the events and do not stop the loop, only a transport error or the loss of the medium does.

        The cycles block the executor thread while waiting for their frames, `stop` is only polled between periods. Tasks sharing that thread are delayed by up to a period.
    */
    pub async fn run<F: Future<Output=()>>(&mut self, stop: F) -> EthercatResult {
        if let Some(priority) = self.config.thread_priority {
            realtime(priority);
        }
        let period = self.config.cycle_period();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = &mut stop => return Ok(()),
                _ = interval.tick() => {
                    let start = Instant::now();
                    match self.cycle() {
                        Ok(_) | Err(EthercatError::PartialCycleFailure {..}) => {},
                        Err(err) => return Err(err),
                    }
                    self.maintenance(start + period)?;
                },
            }
        }
    }

    async fn complete(&mut self, mut handle: TransactionHandle) -> TransactionResult {
        loop {
            let deadline = Instant::now() + self.config.cycle_period();
            self.sdo.service(&mut self.raw, deadline);
            if let Some(result) = handle.poll()
                {return result}
            tokio::task::yield_now().await;
        }
    }
    /// read an SDO when the cycle is not running
    pub async fn sdo_read<T: PduData>(&mut self, slave: u16, sdo: &Sdo<T>) -> EthercatResult<T> {
        let handle = self.sdo.client().read(slave, sdo)?;
        let data = self.complete(handle).await?;
        Ok(T::unpack(&data)?)
    }
    /// write an SDO when the cycle is not running
    pub async fn sdo_write<T: PduData>(&mut self, slave: u16, sdo: &Sdo<T>, value: T) -> EthercatResult {
        let handle = self.sdo.client().write(slave, sdo, value)?;
        self.complete(handle).await?;
        Ok(())
    }

    fn state(&self, station: u16) -> Option<AlState> {
        self.slaves.get(&station).map(SlaveStateMachine::state)
    }
    fn status(&self, descriptor: &SlaveDescriptor) -> Option<SlaveStatus> {
        let machine = self.slaves.get(&descriptor.station)?;
        Some(SlaveStatus {
            descriptor: descriptor.clone(),
            state: machine.state(),
            requested: machine.requested(),
            exchanging: self.scheduler.active().contains(&descriptor.station),
            unresponsive: machine.is_unresponsive(),
        })
    }
    pub fn slave(&self, station: u16) -> Option<SlaveStatus> {
        self.status(self.topology.by_station(station)?)
    }
    pub fn slave_by_name(&self, name: &str) -> Option<SlaveStatus> {
        self.status(self.topology.by_name(name)?)
    }
    /// all slaves in position order
    pub fn list_slaves(&self) -> Vec<SlaveStatus> {
        self.topology.iter()
            .filter_map(|descriptor| self.status(descriptor))
            .collect()
    }

    /**
        bring every slave back to INIT and release the transport

        Slaves are switched in reverse position order, failures are logged and do not stop the shutdown.
    */
    pub async fn shutdown(mut self) -> EthercatResult {
        self.sdo.clear();
        let stations: Vec<u16> = self.slaves.keys().rev().copied().collect();
        for station in stations {
            if let Err(err) = self.transition(station, AlState::Init).await {
                log::warn!("slave {} not back in INIT: {}", station, err);
            }
        }
        log::info!("master shut down");
        Ok(())
    }
}

/// give the current thread a realtime priority, a failure is only logged
#[cfg(target_os = "linux")]
fn realtime(priority: u8) {
    use thread_priority::*;
    let Ok(value) = ThreadPriorityValue::try_from(priority)
        else {
            log::warn!("invalid thread priority {}", priority);
            return
        };
    if let Err(err) = set_thread_priority_and_policy(
            thread_native_id(),
            ThreadPriority::Crossplatform(value),
            ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
            ) {
        log::warn!("cannot set realtime priority: {:?}", err);
    }
}
#[cfg(not(target_os = "linux"))]
fn realtime(priority: u8) {
    log::warn!("realtime priority {} not supported on this platform", priority);
}

/*!
    application layer state machine of one slave

    A slave changes its communication state when the master writes the requested state in its AL control register, and reports the state it actually reached in its AL status register. [SlaveStateMachine] holds what the master knows about one slave and decides the sequence of requests leading to a target state. It owns no I/O: the bus is borrowed for each operation, so any number of state machines can be driven by the single owner of the bus.

    ETG.1000.6 5.3
*/

use std::time::Instant;
use crate::{
    rawmaster::RawMaster,
    registers::{self, AlControl, AlError},
    config::MasterConfig,
    error::{EthercatError, EthercatResult},
    };


pub type CommunicationState = registers::AlState;
use registers::AlState::*;


/// process data sizes (outputs, inputs) in bytes
pub type ProcessSizes = (u16, u16);

/// process data sizes declared by the slave and mapped by the master
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MappingCheck {
    pub declared: ProcessSizes,
    pub mapped: ProcessSizes,
}

/**
    master-side state of one slave's communication

    The state machine guarantees that a slave never skips a state upward: a request for [Operational] from [Init] is sent as the chain `PreOperational, SafeOperational, Operational`, each step confirmed before the next. Downward requests are sent directly.

    ## Example

    ```ignore
    let mut slave = SlaveStateMachine::new(1, true);
    mailbox.configure(&mut raw)?;
    slave.mailbox_configured();
    slave.switch(&mut raw, PreOperational, &config).await?;
    slave.validate_mapping((4, 4), (4, 4))?;
    slave.switch(&mut raw, Operational, &config).await?;
    ```
*/
#[derive(Clone, Debug)]
pub struct SlaveStateMachine {
    /// station address
    station: u16,
    /// last state confirmed by the slave
    current: CommunicationState,
    /// last state requested by the master
    requested: CommunicationState,
    /// false while the slave has a mailbox that is not yet configured
    mailbox_ready: bool,
    mapping: Option<MappingCheck>,
    unresponsive: bool,
}

impl SlaveStateMachine {
    /// state machine of a slave in [Init], `mailbox` tells whether the slave declares a mailbox
    pub fn new(station: u16, mailbox: bool) -> Self {
        Self {
            station,
            current: Init,
            requested: Init,
            mailbox_ready: ! mailbox,
            mapping: None,
            unresponsive: false,
        }
    }
    pub fn station(&self) -> u16  {self.station}
    /// last state confirmed by the slave
    pub fn state(&self) -> CommunicationState  {self.current}
    /// last state requested by the master
    pub fn requested(&self) -> CommunicationState  {self.requested}
    /// true if the slave did not answer or did not confirm its last request
    pub fn is_unresponsive(&self) -> bool  {self.unresponsive}
    pub fn mapping(&self) -> Option<MappingCheck>  {self.mapping}

    /// record that the mailbox sync managers of the slave have been written
    pub fn mailbox_configured(&mut self) {
        self.mailbox_ready = true;
    }
    /**
        record the process data sizes mapped for this slave, and check them against the sizes it declares

        The check is kept, so a later request for [SafeOperational] fails the same way without being sent.
    */
    pub fn validate_mapping(&mut self, declared: ProcessSizes, mapped: ProcessSizes) -> EthercatResult {
        let check = MappingCheck {declared, mapped};
        self.mapping = Some(check);
        self.check_mapping(check)
    }
    /// forget the mapping, it must be validated again before the next [SafeOperational]
    pub fn clear_mapping(&mut self) {
        self.mapping = None;
    }

    fn check_mapping(&self, check: MappingCheck) -> EthercatResult {
        if check.declared != check.mapped {
            return Err(EthercatError::PdoMappingMismatch {
                slave: self.station,
                declared: check.declared,
                mapped: check.mapped,
                })
        }
        Ok(())
    }

    /// check the master-side preconditions of entering the given state
    pub fn check(&self, state: CommunicationState) -> EthercatResult {
        match state {
            PreOperational => if ! self.mailbox_ready
                {return Err(EthercatError::Master("mailbox must be configured before PREOP"))},
            SafeOperational => match self.mapping {
                Some(check) => self.check_mapping(check)?,
                None => return Err(EthercatError::Master("process data mapping must be validated before SAFEOP")),
                },
            _ => {},
        }
        Ok(())
    }

    /**
        send the requests bringing the slave to `target`, and return once it reports this state

        Each step is confirmed by polling the AL status until the configured timeout. On timeout, or if the AL control write is never acknowledged, the slave is marked unresponsive and [EthercatError::Unresponsive] is returned. If the slave refuses a step, its error flag is acknowledged and its AL error code is returned in [EthercatError::Slave].

        The frames are sent with blocking socket calls, only the sleep between polls yields.
    */
    pub async fn switch(&mut self, raw: &mut RawMaster, target: CommunicationState, config: &MasterConfig) -> EthercatResult<(), AlError> {
        self.requested = target;
        self.refresh(raw)?;
        for step in path(self.current, target)? {
            self.check(step)?;
            self.step(raw, step, config).await?;
        }
        Ok(())
    }

    async fn step(&mut self, raw: &mut RawMaster, state: CommunicationState, config: &MasterConfig) -> EthercatResult<(), AlError> {
        log::debug!("slave {} {} -> {}", self.station, self.current, state);
        let mut written = false;
        for attempt in 0 ..= config.al_write_retries {
            match raw.fpwr(self.station, registers::al::control, AlControl::request(state, true))
                .and_then(|answer| answer.one()) {
                Ok(()) => {written = true; break},
                Err(err) => log::debug!("slave {} AL control write failed (attempt {}): {}", self.station, attempt, err),
            }
        }
        if ! written
            {return Err(self.lost())}

        let deadline = Instant::now() + config.al_timeout();
        loop {
            if let Ok(status) = raw.fprd(self.station, registers::al::status).and_then(|answer| answer.one()) {
                if status.error() {
                    let code = raw.fprd(self.station, registers::al::error)?.one()?;
                    let reached = status.al_state()
                        .ok_or(EthercatError::<AlError>::Protocol("undefined slave state"))?;
                    // acknowledge the error, staying in the reached state
                    raw.fpwr(self.station, registers::al::control, AlControl::request(reached, true))?.one()?;
                    self.current = reached;
                    log::warn!("slave {} refused {}: {:?}", self.station, state, code);
                    return Err(EthercatError::Slave(code));
                }
                if status.al_state() == Some(state) {
                    self.current = state;
                    self.unresponsive = false;
                    log::info!("slave {} is in {}", self.station, state);
                    return Ok(())
                }
            }
            if Instant::now() >= deadline
                {return Err(self.lost())}
            tokio::time::sleep(config.al_poll()).await;
        }
    }

    fn lost<T>(&mut self) -> EthercatError<T> {
        self.unresponsive = true;
        log::warn!("slave {} is unresponsive", self.station);
        EthercatError::Unresponsive {slave: self.station}
    }

    /**
        request a lower state without waiting for confirmation

        This is meant for fault containment, when the slave might not answer. Returns true if the slave received the request, which is then taken as its current state. The next diagnosis or [Self::refresh] reads the state actually reached.
    */
    pub fn demote(&mut self, raw: &mut RawMaster, state: CommunicationState) -> EthercatResult<bool> {
        if state.rank() > self.current.rank()
            {return Err(EthercatError::Master("demotion cannot raise the slave state"))}
        self.requested = state;
        let answered = match raw.fpwr(self.station, registers::al::control, AlControl::request(state, true)) {
            Ok(answer) => answer.answers == 1,
            Err(EthercatError::Timeout(_)) => false,
            Err(err) => return Err(err),
        };
        if answered {
            self.current = state;
            log::info!("slave {} demoted to {}", self.station, state);
        }
        else {
            self.unresponsive = true;
            log::warn!("slave {} did not receive its demotion to {}", self.station, state);
        }
        Ok(answered)
    }

    /// read the state currently reported by the slave
    pub fn refresh(&mut self, raw: &mut RawMaster) -> EthercatResult<CommunicationState> {
        let status = match raw.fprd(self.station, registers::al::status).and_then(|answer| answer.one()) {
            Ok(status) => status,
            Err(EthercatError::Timeout(_)) | Err(EthercatError::WorkingCounter {..}) => return Err(self.lost()),
            Err(err) => return Err(err),
        };
        self.current = status.al_state()
            .ok_or(EthercatError::Protocol("undefined slave state"))?;
        self.unresponsive = false;
        Ok(self.current)
    }

    /// record a state observed by other means, like a diagnosis frame
    pub fn observed(&mut self, state: CommunicationState) {
        self.current = state;
        self.unresponsive = false;
    }
    /// record that the slave did not answer a diagnosis
    pub fn missed(&mut self) {
        self.unresponsive = true;
    }
}

/**
    states to request in order to go from `from` to `target`

    Forward moves in the chain `Init, PreOperational, SafeOperational, Operational` are done one step at a time, backward moves are direct. [Bootstrap] is only entered from and left to [Init].
*/
pub fn path(from: CommunicationState, target: CommunicationState) -> EthercatResult<Vec<CommunicationState>> {
    let mut steps = Vec::new();
    let mut state = from;
    if state == target
        {return Ok(steps)}
    if state == Bootstrap || target == Bootstrap {
        if state != Init {
            steps.push(Init);
            state = Init;
        }
        if target == Bootstrap {
            steps.push(Bootstrap);
            return Ok(steps)
        }
    }
    if target.rank() < state.rank() {
        steps.push(target);
        return Ok(steps)
    }
    while state != target {
        state = state.next()
            .ok_or(EthercatError::Master("no path to the requested state"))?;
        steps.push(state);
    }
    Ok(steps)
}


#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use crate::{
        socket::{SimulatedBus, SimulatedSlave},
        mailbox::{Buffer, Mailbox},
        registers::{SyncManagerChannel, SyncMode, SyncDirection},
        };

    #[test]
    fn paths() {
        assert_eq!(path(Init, Operational).unwrap(), [PreOperational, SafeOperational, Operational]);
        assert_eq!(path(PreOperational, SafeOperational).unwrap(), [SafeOperational]);
        assert_eq!(path(Operational, SafeOperational).unwrap(), [SafeOperational]);
        assert_eq!(path(Operational, Init).unwrap(), [Init]);
        assert_eq!(path(SafeOperational, SafeOperational).unwrap(), []);
        assert_eq!(path(Init, Bootstrap).unwrap(), [Bootstrap]);
        assert_eq!(path(PreOperational, Bootstrap).unwrap(), [Init, Bootstrap]);
        assert_eq!(path(Bootstrap, Operational).unwrap(), [Init, PreOperational, SafeOperational, Operational]);
        assert_eq!(path(Bootstrap, Init).unwrap(), [Init]);
    }

    #[test]
    fn preconditions() {
        let mut slave = SlaveStateMachine::new(1, true);
        assert!(matches!(slave.check(PreOperational), Err(EthercatError::Master(_))));
        slave.mailbox_configured();
        assert!(slave.check(PreOperational).is_ok());

        assert!(matches!(slave.check(SafeOperational), Err(EthercatError::Master(_))));
        assert!(matches!(
            slave.validate_mapping((4, 2), (4, 0)),
            Err(EthercatError::PdoMappingMismatch {slave: 1, declared: (4, 2), mapped: (4, 0)}),
            ));
        assert!(matches!(slave.check(SafeOperational), Err(EthercatError::PdoMappingMismatch {..})));
        slave.validate_mapping((4, 2), (4, 2)).unwrap();
        assert!(slave.check(SafeOperational).is_ok());

        assert!(SlaveStateMachine::new(2, false).check(PreOperational).is_ok());
    }

    /// bus with one slave at station 1, with 4 bytes of outputs and 2 of inputs
    fn setup() -> (SimulatedBus, RawMaster, MasterConfig) {
        let bus = SimulatedBus::new(vec![SimulatedSlave::new(2, 0x10).with_process_data(4, 2)]);
        let mut raw = RawMaster::new(bus.clone(), Duration::from_millis(10));
        raw.apwr(0, registers::address::fixed, 1).unwrap().one().unwrap();
        let config = MasterConfig {al_timeout_ms: 50, al_poll_us: 100, .. Default::default()};
        (bus, raw, config)
    }
    fn configure_mailbox(raw: &mut RawMaster, slave: &mut SlaveStateMachine) {
        Mailbox::new(1, Buffer {address: 0x1000, size: 128}, Buffer {address: 0x1080, size: 128})
            .configure(raw).unwrap();
        slave.mailbox_configured();
    }
    fn configure_sync_managers(raw: &mut RawMaster) {
        let interface = registers::sync_manager::interface;
        raw.fpwr(1, interface.outputs(), SyncManagerChannel::configured(0x1100, 4, SyncMode::Buffered, SyncDirection::Write))
            .unwrap().one().unwrap();
        raw.fpwr(1, interface.inputs(), SyncManagerChannel::configured(0x1180, 2, SyncMode::Buffered, SyncDirection::Read))
            .unwrap().one().unwrap();
    }

    #[tokio::test]
    async fn chained_transitions() {
        let (bus, mut raw, config) = setup();
        let mut slave = SlaveStateMachine::new(1, true);

        // nothing is sent when a precondition is not met
        assert!(slave.switch(&mut raw, Operational, &config).await.is_err());
        assert!(bus.transitions(0).is_empty());

        configure_mailbox(&mut raw, &mut slave);
        configure_sync_managers(&mut raw);
        slave.validate_mapping((4, 2), (4, 2)).unwrap();
        slave.switch(&mut raw, Operational, &config).await.unwrap();
        assert_eq!(slave.state(), Operational);
        assert_eq!(bus.transitions(0), [PreOperational, SafeOperational, Operational]);

        slave.switch(&mut raw, PreOperational, &config).await.unwrap();
        assert_eq!(bus.transitions(0), [PreOperational, SafeOperational, Operational, PreOperational]);
        assert_eq!(bus.state(0), Some(PreOperational));
    }

    #[tokio::test]
    async fn refused_transition() {
        let (bus, mut raw, config) = setup();
        let mut slave = SlaveStateMachine::new(1, true);
        configure_mailbox(&mut raw, &mut slave);
        // mapping validated on the master side, but sync managers not written
        slave.validate_mapping((4, 2), (4, 2)).unwrap();

        let result = slave.switch(&mut raw, Operational, &config).await;
        assert!(matches!(result, Err(EthercatError::Slave(AlError::InvalidOutputConfig))));
        assert_eq!(slave.state(), PreOperational);
        assert_eq!(bus.transitions(0), [PreOperational]);
        // the error flag has been acknowledged
        let status = raw.fprd(1, registers::al::status).unwrap().one().unwrap();
        assert!(! status.error());
    }

    #[tokio::test]
    async fn unresponsive() {
        let (bus, mut raw, config) = setup();
        let mut slave = SlaveStateMachine::new(1, true);
        configure_mailbox(&mut raw, &mut slave);

        bus.stick_state(0, true);
        let result = slave.switch(&mut raw, PreOperational, &config).await;
        assert!(matches!(result, Err(EthercatError::Unresponsive {slave: 1})));
        assert!(slave.is_unresponsive());
        assert_eq!(slave.state(), Init);

        bus.stick_state(0, false);
        slave.switch(&mut raw, PreOperational, &config).await.unwrap();
        assert!(! slave.is_unresponsive());

        bus.disconnect(0);
        assert!(matches!(slave.refresh(&mut raw), Err(EthercatError::Unresponsive {slave: 1})));
        assert!(! slave.demote(&mut raw, Init).unwrap());
        assert_eq!(slave.requested(), Init);
        assert_eq!(slave.state(), PreOperational);
    }

    #[tokio::test]
    async fn demotion() {
        let (bus, mut raw, config) = setup();
        let mut slave = SlaveStateMachine::new(1, true);
        configure_mailbox(&mut raw, &mut slave);
        configure_sync_managers(&mut raw);
        slave.validate_mapping((4, 2), (4, 2)).unwrap();
        slave.switch(&mut raw, Operational, &config).await.unwrap();

        assert!(slave.demote(&mut raw, SafeOperational).unwrap());
        assert_eq!(slave.state(), SafeOperational);
        assert_eq!(slave.requested(), SafeOperational);
        assert_eq!(bus.state(0), Some(SafeOperational));
        assert_eq!(slave.refresh(&mut raw).unwrap(), SafeOperational);

        assert!(slave.demote(&mut raw, Operational).is_err());
        assert_eq!(slave.state(), SafeOperational);
    }
}

use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use ecmaster::{
    Master, MasterConfig, Event, AlState, EthercatError,
    SimulatedBus, SimulatedSlave,
    };


fn drives(count: u32) -> SimulatedBus {
    let _ = env_logger::builder().is_test(true).try_init();
    SimulatedBus::new((0 .. count)
        .map(|i| SimulatedSlave::new(0x9a, 0x3000 + i).with_process_data(4, 6))
        .collect())
}

fn config() -> MasterConfig {
    MasterConfig {
        response_timeout_us: 1000,
        al_timeout_ms: 100,
        al_poll_us: 100,
        .. Default::default()
    }
}

fn drain(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    received
}

#[tokio::test]
async fn cable_pull() {
    let bus = drives(3);
    let mut master = Master::new(bus.clone(), config());
    master.bring_up().await.unwrap();
    let image = master.image();
    let mut events = master.subscribe();

    for position in 0 .. 3 {
        bus.set_inputs(position, &[position as u8 + 1; 6]);
    }
    assert_eq!(master.cycle().unwrap(), 9);
    assert_eq!(image.inputs(2).unwrap(), [2; 6]);

    // the second slave stops answering, the image keeps its last complete inputs
    bus.disconnect(1);
    bus.set_inputs(0, &[7; 6]);
    for _ in 0 .. master.config().cycle_failures_before_demote {
        assert!(matches!(
            master.cycle(),
            Err(EthercatError::PartialCycleFailure {expected: 9, answered: 6}),
            ));
        assert_eq!(image.inputs(1).unwrap(), [1; 6]);
    }
    let received = drain(&mut events);
    assert!(received.contains(&Event::PartialCycleFailure {expected: 9, answered: 6}));
    assert!(received.contains(&Event::Demoted {slave: 2, state: AlState::SafeOperational}));
    assert!(received.contains(&Event::Unresponsive {slave: 2}));

    let pulled = master.slave(2).unwrap();
    assert_eq!(pulled.requested, AlState::SafeOperational);
    assert!(pulled.unresponsive);
    assert!(! pulled.exchanging);
    for station in [1, 3] {
        let slave = master.slave(station).unwrap();
        assert_eq!(slave.state, AlState::Operational);
        assert!(slave.exchanging);
    }

    // the other slaves keep exchanging
    image.write_output::<u32>(3, 0, 0xdead_beef).unwrap();
    assert_eq!(master.cycle().unwrap(), 6);
    assert_eq!(image.inputs(1).unwrap(), [7; 6]);
    assert_eq!(image.inputs(2).unwrap(), [2; 6]);
    assert_eq!(bus.outputs(2), 0xdead_beef_u32.to_le_bytes());

    master.maintenance(Instant::now() + Duration::from_millis(10)).unwrap();
    assert_eq!(drain(&mut events), [Event::TopologyChanged {expected: 3, found: 2}]);
    // checked once
    master.maintenance(Instant::now() + Duration::from_millis(10)).unwrap();
    assert!(drain(&mut events).is_empty());

    // plugged back, the slave can be brought back into the exchange
    bus.reconnect(1);
    master.request_state(2, AlState::Operational).await.unwrap();
    let plugged = master.slave(2).unwrap();
    assert!(plugged.exchanging);
    assert!(! plugged.unresponsive);
    assert_eq!(master.cycle().unwrap(), 9);
    assert_eq!(master.scheduler().active(), [1, 2, 3]);
}

#[tokio::test]
async fn silent_slave() {
    let bus = drives(3);
    let mut master = Master::new(bus.clone(), config());
    master.bring_up().await.unwrap();
    let image = master.image();
    let mut events = master.subscribe();
    assert_eq!(master.cycle().unwrap(), 9);

    // the slave still reports OP, only the working counter tells it is missing
    bus.clear_fmmus(1);
    bus.set_inputs(0, &[4; 6]);
    for _ in 0 .. master.config().cycle_failures_before_demote {
        assert!(matches!(
            master.cycle(),
            Err(EthercatError::PartialCycleFailure {expected: 9, answered: 6}),
            ));
    }
    let received = drain(&mut events);
    assert!(received.contains(&Event::Demoted {slave: 2, state: AlState::SafeOperational}));
    assert!(! received.contains(&Event::Unresponsive {slave: 2}));
    assert!(! received.iter().any(|event| matches!(event, Event::Demoted {slave: 1 | 3, ..})));

    let silent = master.slave(2).unwrap();
    assert_eq!(silent.state, AlState::SafeOperational);
    assert!(! silent.exchanging);
    assert_eq!(bus.state(1), Some(AlState::SafeOperational));

    assert_eq!(master.cycle().unwrap(), 6);
    assert_eq!(image.inputs(1).unwrap(), [4; 6]);
    assert_eq!(master.scheduler().active(), [1, 3]);
}

#[tokio::test]
async fn transient_failure() {
    let bus = drives(2);
    let mut master = Master::new(bus.clone(), config());
    master.bring_up().await.unwrap();
    let mut events = master.subscribe();

    // a single lost frame does not demote anybody
    bus.drop_frames(1);
    assert!(matches!(
        master.cycle(),
        Err(EthercatError::PartialCycleFailure {expected: 6, answered: 0}),
        ));
    assert_eq!(master.cycle().unwrap(), 6);
    assert_eq!(master.scheduler().active(), [1, 2]);

    // the slaves still answer the count
    master.maintenance(Instant::now() + Duration::from_millis(10)).unwrap();
    assert_eq!(drain(&mut events), [Event::PartialCycleFailure {expected: 6, answered: 0}]);
}

#[tokio::test]
async fn medium_lost() {
    let bus = drives(2);
    let mut master = Master::new(bus.clone(), MasterConfig {
        lost_frames_before_medium_lost: 3,
        .. config()
    });
    master.bring_up().await.unwrap();
    let mut events = master.subscribe();

    bus.drop_frames(usize::MAX);
    let mut cycles = 0;
    let err = loop {
        cycles += 1;
        match master.cycle() {
            Err(EthercatError::PartialCycleFailure {..}) if cycles < 10 => continue,
            result => break result.unwrap_err(),
        }
    };
    assert!(matches!(err, EthercatError::Io(_)));
    assert!(matches!(master.cycle(), Err(EthercatError::Io(_))));
    let lost: Vec<_> = drain(&mut events).into_iter()
        .filter(|event| *event == Event::MediumLost)
        .collect();
    assert_eq!(lost.len(), 1);

    // nobody was demoted while the medium was down
    bus.drop_frames(0);
    assert_eq!(master.cycle().unwrap(), 6);
    assert_eq!(master.scheduler().active(), [1, 2]);
}

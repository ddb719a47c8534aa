/*!
    EtherCAT master protocol stack

    The crate is organized from the wire up to the control loop:

    - [frame] encodes and decodes ethercat frames and their PDUs
    - [socket] carries frames over raw ethernet, UDP, or a simulated segment
    - [rawmaster] sends frames and waits for their echo, it is the single owner of the bus
    - [topology] scans the segment, assigns station addresses and reads the slaves' EEPROM through [sii]
    - [slave] drives the AL state machine of each slave
    - [mailbox], [can] and [sdo] transfer SDOs with the slaves
    - [mapping] lays out the process image and [scheduler] exchanges it every cycle
    - [master] orchestrates everything: bring-up, cycles, fault containment, events

    Most applications only need [Master] and [MasterConfig]:

    ```ignore
    let mut master = Master::new(EthernetSocket::new("eno1")?, MasterConfig::default());
    master.bring_up().await?;
    let image = master.image();
    master.run(tokio::signal::ctrl_c()).await?;
    master.shutdown().await?;
    ```
*/

pub mod data;
pub mod error;
pub mod frame;
pub mod registers;
pub mod socket;
pub mod rawmaster;
pub mod sii;
pub mod topology;
pub mod slave;
pub mod mailbox;
pub mod can;
pub mod sdo;
pub mod mapping;
pub mod scheduler;
pub mod config;
pub mod master;

pub use crate::data::{PduData, Field};
pub use crate::error::{EthercatError, EthercatResult};
pub use crate::frame::{Frame, Pdu, PduCommand};
pub use crate::socket::*;
pub use crate::rawmaster::{RawMaster, SlaveAddress};
pub use crate::registers::AlState;
pub use crate::topology::{Topology, SlaveDescriptor};
pub use crate::slave::{SlaveStateMachine, CommunicationState};
pub use crate::sdo::{Sdo, SdoClient, SdoOperation, TransactionHandle, TransactionState};
pub use crate::mapping::ProcessImage;
pub use crate::config::{MasterConfig, SlaveConfig};
pub use crate::master::{Master, Event, Hook, SlaveStatus};

/*!
    map of the ESC registers accessed by the master: addressing, SII, FMMU, sync managers and AL state

    Every register address used elsewhere in the crate comes from here. Composite registers are [bilge] structs packed with [data::bilge_pdudata], so they can be read and written as any [data::PduData].
*/

use core::fmt;
use bilge::prelude::*;
use serde::{Deserialize, Serialize};
use crate::data::{self, Field};

pub mod address {
    use super::*;

    /// configured station address, used by the FP* commands
    /// ETG.1000.4 table 32
    pub const fixed: Field<u16> = Field::simple(0x0010);
    /// station alias, stored in the EEPROM
    /// ETG.1000.4 table 32
    pub const alias: Field<u16> = Field::simple(0x0012);
}

/// controller type, present in every ESC, the scan probes it to detect slaves
/// ETG.1000.4 table 31
pub const controller_type: Field<u8> = Field::simple(0x0000);

/// access to the slave EEPROM (identity, mailbox and sync manager declarations)
pub mod sii {
    use super::*;

	pub const control: Field<SiiControl> = Field::simple(0x0502);
	/// EEPROM word address of the next operation
	pub const address: Field<u32> = Field::simple(0x0504);
	/// 4 bytes read by the last operation
	pub const data: Field<[u8; 4]> = Field::simple(0x0508);
}

/// entries translating logical addresses to the slave physical memory
pub const fmmu: FMMU = FMMU {address: 0x0600, num: 16};

/// sync manager channels guarding the mailbox and process data buffers
pub mod sync_manager {
    use super::*;
	pub const interface: SyncManager = SyncManager {address: 0x0800, num: 16};
}

/// application layer state requests and reports
pub mod al {
    use super::*;

    pub const control: Field<AlControl> = Field::simple(0x0120);
    pub const status: Field<AlStatus> = Field::simple(0x0130);
    pub const error: Field<AlError> = Field::simple(0x0134);
}



/**
    communication state of a slave

    Forward transitions go one step at a time along `Init, PreOperational, SafeOperational, Operational`, backward ones can skip states. [Self::Bootstrap] is only entered from and left to [Self::Init].

    ETG.1000.6 table 9
*/
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AlState {
    /// registers only: addresses, sync managers and FMMUs are set up here
    Init = 1,
    /// mailbox communication available, no process data
    PreOperational = 2,
    /// firmware update mode, reachable only from [Self::Init]
    Bootstrap = 3,
    /// inputs are exchanged, outputs are ignored by the slave
    SafeOperational = 4,
    /// inputs and outputs are exchanged
    Operational = 8,
}
impl AlState {
    /// rank of the state in the forward chain `Init < PreOperational < SafeOperational < Operational`, [Self::Bootstrap] is aside
    pub fn rank(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Bootstrap => 0,
            Self::PreOperational => 1,
            Self::SafeOperational => 2,
            Self::Operational => 3,
        }
    }
    /// next state in the forward chain, if any
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Init => Some(Self::PreOperational),
            Self::PreOperational => Some(Self::SafeOperational),
            Self::SafeOperational => Some(Self::Operational),
            Self::Operational => None,
            Self::Bootstrap => None,
        }
    }
    /// true if the slave takes part to the process data exchange in this state
    pub fn exchanges_process_data(self) -> bool {
        matches!(self, Self::SafeOperational | Self::Operational)
    }
}
impl TryFrom<u8> for AlState {
    type Error = &'static str;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Init),
            2 => Ok(Self::PreOperational),
            3 => Ok(Self::Bootstrap),
            4 => Ok(Self::SafeOperational),
            8 => Ok(Self::Operational),
            _ => Err("unknown AL state code"),
        }
    }
}
impl From<AlState> for u8 {
    fn from(state: AlState) -> u8 {state as u8}
}
impl fmt::Display for AlState {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "INIT",
            Self::PreOperational => "PREOP",
            Self::Bootstrap => "BOOT",
            Self::SafeOperational => "SAFEOP",
            Self::Operational => "OP",
        })
	}
}

/// ETG.1000.6 table 9
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct AlControl {
    /// requested state of communication, code of [AlState]
    pub state: u4,
    /// if true, the error flag of [AlStatus] will be reset
    pub ack: bool,
    /// request of id instead of error code in [al::error]
    pub request_id: bool,
    reserved: u2,
}
data::bilge_pdudata!(AlControl, u8);

impl AlControl {
    pub fn request(state: AlState, ack: bool) -> Self {
        let mut control = Self::from(0u8);
        control.set_state(u4::new(state.into()));
        control.set_ack(ack);
        control
    }
}

/// ETG.1000.6 table 12
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct AlStatus {
    /// current state of communication, code of [AlState]
    pub state: u4,
    /// true if the last requested transition failed, the error code is then in [al::error]
    pub error: bool,
    reserved: u3,
}
data::bilge_pdudata!(AlStatus, u8);

impl AlStatus {
    pub fn new_state(state: AlState, error: bool) -> Self {
        let mut status = Self::from(0u8);
        status.set_state(u4::new(state.into()));
        status.set_error(error);
        status
    }
    /// decoded state, or `None` if the slave reports a state code that is not defined
    pub fn al_state(&self) -> Option<AlState> {
        AlState::try_from(self.state().value()).ok()
    }
}

data::code_enum!{
/// reason reported by a slave refusing or leaving a state, read from the AL status code register
pub enum AlError: u16 {
    NoError = 0x0000,
    Unspecified = 0x0001,
    NoMemory = 0x0002,
    InvalidDeviceSetup = 0x0003,
    InvalidStateRequest = 0x0011,
    UnknownStateRequest = 0x0012,
    BootstrapNotSupported = 0x0013,
    NoValidFirmware = 0x0014,
    /// mailbox sync managers rejected when entering [AlState::Bootstrap]
    InvalidMailboxConfigBoot = 0x0015,
    /// mailbox sync managers rejected when entering [AlState::PreOperational]
    InvalidMailboxConfigPreop = 0x0016,
    InvalidSyncConfig = 0x0017,
    NoInputsAvailable = 0x0018,
    NoValidOutputs = 0x0019,
    Synchronization = 0x001A,
    SyncWatchdog = 0x001B,
    InvalidSyncTypes = 0x001C,
    InvalidOutputConfig = 0x001D,
    InvalidInputConfig = 0x001E,
    InvalidWatchdogConfig = 0x001F,
    NeedColdStart = 0x0020,
    NeedInit = 0x0021,
    NeedPreop = 0x0022,
    NeedSafeOp = 0x0023,
    InvalidInputMapping = 0x0024,
    InvalidOutputMapping = 0x0025,
    InconsistentSettings = 0x0026,
    BackgroundWatchdog = 0x002A,
    NoValidIO = 0x002B,
    /// error in the CoE layer of the slave
    MailboxCoe = 0x0043,
    Eeprom = 0x0051,
    SlaveRestarted = 0x0060,
}
}

/**
    command and status word of the EEPROM interface, see [crate::sii]

	ETG.1000.4 table 49
*/
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct SiiControl {
	pub write_access: bool,
	reserved: u4,
	/// DL-user emulates SII, cannot be set by the master
	pub eeprom_emulation: bool,
	/// number of bytes per read transaction: false for 4 bytes, true for 8 bytes
	pub read_size: bool,
	/// unit of SII addresses: false for bytes, true for words
	pub address_unit: bool,

	/// set to start a read, stays set while the read is in progress
	pub read_operation: bool,
	pub write_operation: bool,
	pub reload_operation: bool,

	pub checksum_error: bool,
	pub device_info_error: bool,
	/// error on last SII request
	pub command_error: bool,
	pub write_error: bool,

	/// the EEPROM interface has not finished the last operation
	pub busy: bool,
}
data::bilge_pdudata!(SiiControl, u16);

impl SiiControl {
    /// control value starting a read operation
    pub fn read() -> Self {
        let mut control = Self::from(0u16);
        control.set_read_operation(true);
        control
    }
}

/// location of the FMMU entries, each one is 16 bytes
/// ETG.1000.4 table 57
pub struct FMMU {
	pub address: u16,
	pub num: u8,
}

impl FMMU {
    pub fn entry(&self, index: u8) -> Field<FmmuEntry>  {
        debug_assert!(index < self.num, "index out of range");
        Field::simple(usize::from(self.address + u16::from(index)*0x10))
    }
}

/**
	one FMMU entry, copying a range of the logical memory from or to the slave physical memory as LRD/LWR/LRW PDUs pass

	This master only uses byte-aligned entries.

	ETG.1000.4 table 56
*/
#[bitsize(128)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct FmmuEntry {
	pub logical_start_byte: u32,
	pub logical_len_byte: u16,
	pub logical_start_bit: u3,
	reserved: u5,
	/// last bit of the last logical byte, 7 for byte-aligned entries
	pub logical_end_bit: u3,
	reserved: u5,

	pub physical_start_byte: u16,
	pub physical_start_bit: u3,
	reserved: u5,

	/// copy physical to logical memory
	pub read: bool,
	/// copy logical to physical memory
	pub write: bool,
	reserved: u6,

	pub enable: bool,
	reserved: u7,
	reserved: u24,
}
data::bilge_pdudata!(FmmuEntry, u128);

impl FmmuEntry {
    /// disabled entry
    pub fn disabled() -> Self {Self::from(0u128)}
    /// byte-aligned mapping of `len` bytes of physical memory to the logical memory
    pub fn mapping(logical: u32, len: u16, physical: u16, direction: SyncDirection) -> Self {
        let mut entry = Self::disabled();
        entry.set_logical_start_byte(logical);
        entry.set_logical_len_byte(len);
        entry.set_logical_end_bit(u3::new(7));
        entry.set_physical_start_byte(physical);
        entry.set_read(direction == SyncDirection::Read);
        entry.set_write(direction == SyncDirection::Write);
        entry.set_enable(true);
        entry
    }
}

/// location of the sync manager channels, each one is 8 bytes
/// ETG.1000.4 table 59
pub struct SyncManager {
    pub address: u16,
    pub num: u8,
}

impl SyncManager {
    pub fn channel(&self, index: u8) -> Field<SyncManagerChannel> {
        debug_assert!(index < self.num, "index out of range");
        Field::simple(usize::from(self.address + u16::from(index) * 8))
    }
    /// return the sync manager channel reserved for mailbox in
    pub fn mailbox_write(&self) -> Field<SyncManagerChannel>   {self.channel(0)}
    /// return the sync manager channel reserved for mailbox out
    pub fn mailbox_read(&self) -> Field<SyncManagerChannel>   {self.channel(1)}
    /// return the sync manager channel receiving the outputs of the process image
    pub fn outputs(&self) -> Field<SyncManagerChannel>   {self.channel(2)}
    /// return the sync manager channel providing the inputs of the process image
    pub fn inputs(&self) -> Field<SyncManagerChannel>   {self.channel(3)}
}

/**
    one sync manager channel, guarding a buffer of the slave physical memory

    In [SyncMode::Mailbox] a buffer written by one side is locked until the other side read it. In [SyncMode::Buffered] both sides access it at any time and the reader always gets the last complete write.

    ETG.1000.4 table 58
*/
#[bitsize(64)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct SyncManagerChannel {
    /// physical address of the buffer
    pub address: u16,
    pub length: u16,
    /// code of [SyncMode]
    pub mode: u2,
    /// code of [SyncDirection]
    pub direction: u2,

    pub ec_event: bool,
    pub dls_user_event: bool,
    pub watchdog: bool,
    reserved: u1,
    pub write_event: bool,
    pub read_event: bool,
    reserved: u1,

    /// a mailbox buffer holds a message not yet read
    pub mailbox_full: bool,
    pub buffer_state: u2,
    pub read_buffer_open: bool,
    pub write_buffer_open: bool,

    pub enable: bool,
    /// toggled by the master to get the last mailbox message again
    pub repeat: bool,
    reserved: u4,

    pub dc_event_bus: bool,
    pub dc_event_local: bool,
    pub disable_pdi: bool,
    pub repeat_ack: bool,
    reserved: u6,
}
data::bilge_pdudata!(SyncManagerChannel, u64);

impl SyncManagerChannel {
    /// disabled channel
    pub fn disabled() -> Self {Self::from(0u64)}
    /// enabled channel covering the given physical memory
    pub fn configured(address: u16, length: u16, mode: SyncMode, direction: SyncDirection) -> Self {
        let mut channel = Self::disabled();
        channel.set_address(address);
        channel.set_length(length);
        channel.set_mode(u2::new(mode as u8));
        channel.set_direction(u2::new(direction as u8));
        channel.set_dls_user_event(mode == SyncMode::Mailbox);
        channel.set_enable(true);
        channel
    }
}

/// ETG.1000.4 table 58
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum SyncMode {
    Buffered = 0,
    Mailbox = 2,
}
/// ETG.1000.4 table 58
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum SyncDirection {
    /// sync manager buffer is read by the master
    Read = 0,
    /// sync manager buffer is written by the master
    Write = 1,
}

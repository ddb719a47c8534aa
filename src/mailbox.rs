/*!
    implementation of the communication with a slave's mailbox

    A mailbox is a pair of sync manager channels in handshake mode: the master writes requests in the write buffer (sync manager 0) and reads the slave's answers in the read buffer (sync manager 1). Each buffer can only be accessed once it has been released by the other side, which is checked with the sync manager status.

    ETG 1000.4 5.6
*/

use crate::{
	rawmaster::RawMaster,
    frame::PduCommand,
	registers::{self, SyncManagerChannel, SyncMode, SyncDirection},
    data::{self, PduData, PackingError, PackingResult, Storage},
    error::{EthercatError, EthercatResult},
	};

/// byte size of the mailbox header
pub const MAILBOX_HEADER: usize = 6;

/// location of a sync manager buffer in a slave's physical memory
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Buffer {
    pub address: u16,
    pub size: u16,
}

/**
    implementation of communication with a slave's mailbox

    This struct does not wait: each method does one step of the handshake and tells whether it could progress, so the caller can interleave mailbox steps with other traffic.
*/
#[derive(Clone, Debug)]
pub struct Mailbox {
    /// station address of the slave
	slave: u16,
	write: Buffer,
	read: Buffer,
	/// last counter value used, 0 before the first request
	count: u8,
}

impl Mailbox {
    pub fn new(slave: u16, write: Buffer, read: Buffer) -> Self {
        Self {slave, write, read, count: 0}
    }
    pub fn slave(&self) -> u16  {self.slave}
    pub fn write_buffer(&self) -> Buffer  {self.write}
    pub fn read_buffer(&self) -> Buffer  {self.read}
    /// maximum payload of a request or answer, following the mailbox header
    pub fn capacity(&self) -> usize {
        usize::from(self.write.size.min(self.read.size)).saturating_sub(MAILBOX_HEADER)
    }

    /// counter of the next request, rolling from 1 to 7
    pub fn next_count(&mut self) -> u8 {
        self.count = (self.count % 7) + 1;
        self.count
    }

    /// write the sync manager channels 0 and 1 to the mailbox buffers. The slave must be in [registers::AlState::Init]
    pub fn configure(&self, raw: &mut RawMaster) -> EthercatResult {
        let interface = registers::sync_manager::interface;
        raw.fpwr(self.slave, interface.mailbox_write(), SyncManagerChannel::configured(
            self.write.address, self.write.size, SyncMode::Mailbox, SyncDirection::Write,
            ))?.one()?;
        raw.fpwr(self.slave, interface.mailbox_read(), SyncManagerChannel::configured(
            self.read.address, self.read.size, SyncMode::Mailbox, SyncDirection::Read,
            ))?.one()?;
        Ok(())
    }

    /**
        write the given payload in the slave's write buffer, with a mailbox header of counter `count`

        Returns `false` without writing if the slave has not yet released its previous request.
    */
	pub fn write(&self, raw: &mut RawMaster, ty: MailboxType, count: u8, payload: &[u8]) -> EthercatResult<bool> {
        if payload.len() > self.capacity()
            {return Err(EthercatError::Master("payload exceeds the mailbox capacity"))}
		let status = raw.fprd(self.slave, registers::sync_manager::interface.mailbox_write())?.one()?;
		if status.mailbox_full()
            {return Ok(false)}

        let mut buffer = vec![0; usize::from(self.write.size)];
        MailboxHeader {
            length: payload.len() as u16,
            address: 0,
            priority: 0,
            ty,
            count,
        }.pack(&mut buffer)?;
        buffer[MAILBOX_HEADER ..][.. payload.len()].copy_from_slice(payload);
        // the whole buffer must be written for the slave to see the request
        let answers = raw.pdu(PduCommand::FPWR, self.slave, self.write.address, &mut buffer)?;
        if answers != 1
            {return Err(EthercatError::WorkingCounter {expected: 1, answered: answers})}
        Ok(true)
	}

    /**
        read the frame currently in the slave's read buffer

        Returns `None` if there is no frame available. Reading the buffer releases it so the slave can write the next one.
    */
	pub fn read(&self, raw: &mut RawMaster) -> EthercatResult<Option<(MailboxHeader, Vec<u8>)>> {
		let status = raw.fprd(self.slave, registers::sync_manager::interface.mailbox_read())?.one()?;
		if ! status.mailbox_full()
            {return Ok(None)}

        let mut buffer = vec![0; usize::from(self.read.size)];
        let answers = raw.pdu(PduCommand::FPRD, self.slave, self.read.address, &mut buffer)?;
        if answers != 1
            {return Err(EthercatError::WorkingCounter {expected: 1, answered: answers})}
        let header = MailboxHeader::unpack(&buffer)?;
        let payload = buffer.get(MAILBOX_HEADER .. MAILBOX_HEADER + usize::from(header.length))
            .ok_or(EthercatError::Protocol("mailbox frame longer than the buffer"))?
            .to_vec();
        Ok(Some((header, payload)))
	}
}


/// ETG 1000.4 table 29
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MailboxHeader {
    /// length of the mailbox service data following this header
    pub length: u16,
    /**
        - if a master is client: Station Address of the source
        - if a slave is client: Station Address of the destination
    */
    pub address: u16,
    /// 0 is lowest priority, 3 is highest
    pub priority: u8,
    pub ty: MailboxType,
    /// Counter of the mailbox services (0 reserved, this should roll from 1 to 7 and overflow to 1 after 7)
    pub count: u8,
}
impl PduData for MailboxHeader {
    const ID: data::TypeId = data::TypeId::CUSTOM;
    type Packed = [u8; MAILBOX_HEADER];

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        if dst.len() < Self::Packed::LEN
            {return Err(PackingError::BadSize(dst.len(), "no room for mailbox header"))}
        dst[0..2].copy_from_slice(&self.length.to_le_bytes());
        dst[2..4].copy_from_slice(&self.address.to_le_bytes());
        // channel is reserved for future use
        dst[4] = (self.priority & 0b11) << 6;
        dst[5] = (u8::from(self.ty) & 0x0f) | ((self.count & 0b111) << 4);
        Ok(())
    }
    fn unpack(src: &[u8]) -> PackingResult<Self> {
        if src.len() < Self::Packed::LEN
            {return Err(PackingError::BadSize(src.len(), "truncated mailbox header"))}
        Ok(Self {
            length: u16::from_le_bytes([src[0], src[1]]),
            address: u16::from_le_bytes([src[2], src[3]]),
            priority: src[4] >> 6,
            ty: MailboxType::from(src[5] & 0x0f),
            count: (src[5] >> 4) & 0b111,
        })
    }
}

data::code_enum!{
/// ETG 1000.4 table 29
pub enum MailboxType: u8 {
    /// mailbox error reply
    Exception = 0x0,
    Ads = 0x1,
    Ethernet = 0x2,
    Can = 0x3,
    File = 0x4,
    Servo = 0x5,
    Specific = 0xf,
}
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let header = MailboxHeader {length: 10, address: 0, priority: 0, ty: MailboxType::Can, count: 5};
        let mut buffer = [0; MAILBOX_HEADER];
        header.pack(&mut buffer).unwrap();
        assert_eq!(buffer, [10, 0, 0, 0, 0, 0x53]);
        assert_eq!(MailboxHeader::unpack(&buffer).unwrap(), header);
    }

    #[test]
    fn counter_rolls_over() {
        let buffer = Buffer {address: 0x1000, size: 128};
        let mut mailbox = Mailbox::new(1, buffer, buffer);
        let counts: Vec<u8> = (0 .. 9).map(|_| mailbox.next_count()).collect();
        assert_eq!(counts, [1, 2, 3, 4, 5, 6, 7, 1, 2]);
        assert_eq!(mailbox.capacity(), 122);
    }
}

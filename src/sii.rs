/*!
    SII (Slave Information Interface) gives access to a slave's EEPROM, describing the slave as a manifest: identity, recommended mailbox setup, sync managers, strings ...

    The EEPROM is organized in 16 bit words. It starts with fixed registers (declared in [eeprom]) and continues with a sequence of categories, each one starting with a [CategoryHeader].

    ETG.1000.6 5.4
*/

use core::time::Duration;
use std::time::Instant;
use bilge::prelude::*;
use crate::{
    rawmaster::RawMaster,
    registers,
    mailbox::Buffer,
    data::{self, Field, PduData, Storage, Cursor},
    error::{EthercatError, EthercatResult},
    };


/// byte size of an EEPROM address unit
pub const WORD: usize = core::mem::size_of::<u16>();
/// bytes returned by one SII read operation
const CHUNK: usize = 4;
/// the category list stops anyway after this number of categories
const MAX_CATEGORIES: usize = 128;


/// registers in the EEPROM, ETG.1000.6 5.4 table 16
pub mod eeprom {
    use super::*;

    /// station alias configured by the vendor or integrator, 0 when unused
    pub const address_alias: Field<u16> = Field::simple(WORD*0x0004);

    pub mod device {
        use super::*;

        pub const vendor: Field<u32> = Field::simple(WORD*0x0008);
        pub const product: Field<u32> = Field::simple(WORD*0x000a);
        pub const revision: Field<u32> = Field::simple(WORD*0x000c);
        pub const serial_number: Field<u32> = Field::simple(WORD*0x000e);
    }

    /// mailbox recommended parameters outside of [crate::registers::AlState::Bootstrap]
    pub mod mailbox {
        use super::*;

        // receive is written by the master, send is read by the master
        pub const receive_offset: Field<u16> = Field::simple(WORD*0x0018);
        pub const receive_size: Field<u16> = Field::simple(WORD*0x0019);
        pub const send_offset: Field<u16> = Field::simple(WORD*0x001a);
        pub const send_size: Field<u16> = Field::simple(WORD*0x001b);
        pub const protocols: Field<MailboxTypes> = Field::simple(WORD*0x001c);
    }

    /// layout version of the EEPROM
    pub const version: Field<u16> = Field::simple(WORD*0x003f);
    /// first category header
    pub const categories: usize = WORD*0x0040;
}


/// mailbox protocols a slave declares in its EEPROM, only [Self::can] is used by this master
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct MailboxTypes {
    pub ads: bool,
    pub ethernet: bool,
    /// CoE, needed for SDO transfers
    pub can: bool,
    pub file: bool,
    pub servo: bool,
    pub specific: bool,
    reserved: u2,
}
data::bilge_pdudata!(MailboxTypes, u8);

/// two words preceding the content of each category
#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct CategoryHeader {
    /// code of [CategoryType]
    pub category: u15,
    pub specific: bool,
    /// content size in words
    pub size: u16,
}
data::bilge_pdudata!(CategoryHeader, u32);

data::code_enum!{
/// type of category in the SII, ETG.1000.6 table 19
pub enum CategoryType: u16 {
    Nop = 0,
    /// strings referenced by index from the other categories
    Strings = 10,
    DataTypes = 20,
    /// holds the index of the device name
    General = 30,
    Fmmu = 40,
    SyncManager = 41,
    TxPdo = 50,
    RxPdo = 51,
    Dc = 60,
    /// no category follows
    End = 0x7fff,
}
}

/// one entry of the sync manager category, ETG.1000.6 table 24
#[bitsize(64)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct CategorySyncManager {
    /// physical start address in the slave memory
    pub address: u16,
    pub length: u16,
    /// value to write in the sync manager control register
    pub control: u8,
    pub status: u8,
    pub enable: u8,
    /// code of [SyncManagerUsage]
    pub usage: u8,
}
data::bilge_pdudata!(CategorySyncManager, u64);

data::code_enum!{
/// role of a sync manager declared in the EEPROM
pub enum SyncManagerUsage: u8 {
    Disabled = 0x0,
    /// mailbox written by the master
    MailboxOut = 0x1,
    /// mailbox read by the master
    MailboxIn = 0x2,
    ProcessOut = 0x3,
    ProcessIn = 0x4,
}
}

/// general category content used by this master, ETG.1000.6 table 21
const GENERAL_NAME: usize = 3;


/// identity of a slave device
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Identity {
    pub vendor: u32,
    pub product: u32,
    pub revision: u32,
    pub serial: u32,
}

/// everything this master needs from a slave's EEPROM
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SlaveInformation {
    pub identity: Identity,
    /// standard mailbox buffers (write, read), if the slave has a mailbox
    pub mailbox: Option<(Buffer, Buffer)>,
    pub protocols: MailboxTypes,
    /// buffer of process data written by the master, with its declared size
    pub outputs: Buffer,
    /// buffer of process data read by the master, with its declared size
    pub inputs: Buffer,
    /// device name, empty if the EEPROM does not give one
    pub name: String,
}

/// a category read from the EEPROM
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Category {
    pub ty: CategoryType,
    pub data: Vec<u8>,
}


/**
    implementation of the Slave Information Interface (SII) to read a slave's EEPROM memory

    Each read operation transfers 4 bytes: the EEPROM word address is written, a read operation is started in the control register, then the data register is read once the interface is not busy anymore.
*/
pub struct Sii<'a> {
    raw: &'a mut RawMaster,
    slave: u16,
    timeout: Duration,
}

impl<'a> Sii<'a> {
    /// `slave` is the station address, `timeout` bounds the wait for each read operation
    pub fn new(raw: &'a mut RawMaster, slave: u16, timeout: Duration) -> Self {
        Self {raw, slave, timeout}
    }

    /// wait for the interface to finish its current operation
    fn available(&mut self) -> EthercatResult<registers::SiiControl> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let control = self.raw.fprd(self.slave, registers::sii::control)?.one()?;
            if ! control.busy() && ! control.read_operation()
                {return Ok(control)}
            if Instant::now() > deadline
                {return Err(EthercatError::Timeout("sii stays busy"))}
        }
    }

    /// read 4 bytes at the given word address
    fn chunk(&mut self, word: u32) -> EthercatResult<[u8; CHUNK]> {
        self.available()?;
        self.raw.fpwr(self.slave, registers::sii::address, word)?.one()?;
        self.raw.fpwr(self.slave, registers::sii::control, registers::SiiControl::read())?.one()?;
        let control = self.available()?;
        if control.command_error()
            {return Err(EthercatError::Protocol("sii read command failed"))}
        self.raw.fprd(self.slave, registers::sii::data)?.one()
    }

    /// read `len` bytes starting at the given byte address, which must be word aligned
    pub fn read_bytes(&mut self, byte: usize, len: usize) -> EthercatResult<Vec<u8>> {
        if byte % WORD != 0
            {return Err(EthercatError::Master("sii addresses are word aligned"))}
        let mut buffer = Vec::with_capacity(len + CHUNK);
        while buffer.len() < len {
            let word = u32::try_from((byte + buffer.len()) / WORD)
                .map_err(|_| EthercatError::Master("sii address out of range"))?;
            buffer.extend_from_slice(&self.chunk(word)?);
        }
        buffer.truncate(len);
        Ok(buffer)
    }

    /// read a register of the EEPROM
    pub fn read<T: PduData>(&mut self, field: Field<T>) -> EthercatResult<T> {
        let mut buffer = T::Packed::zeroed();
        let data = self.read_bytes(field.byte, field.len)?;
        buffer.as_mut()[.. data.len()].copy_from_slice(&data);
        Ok(T::unpack(buffer.as_ref())?)
    }

    /// read all categories until the end marker
    pub fn categories(&mut self) -> EthercatResult<Vec<Category>> {
        let mut categories = Vec::new();
        let mut byte = eeprom::categories;
        while categories.len() < MAX_CATEGORIES {
            let header = CategoryHeader::unpack(&self.read_bytes(byte, CategoryHeader::packed_size())?)?;
            let ty = CategoryType::from(header.category().value());
            // an erased EEPROM also reads as the end marker
            if ty == CategoryType::End
                {break}
            byte += CategoryHeader::packed_size();
            let size = usize::from(header.size()) * WORD;
            categories.push(Category {ty, data: self.read_bytes(byte, size)?});
            byte += size;
        }
        Ok(categories)
    }

    /// read the identity, mailbox and process data buffers of the slave
    pub fn information(&mut self) -> EthercatResult<SlaveInformation> {
        let identity = Identity {
            vendor: self.read(eeprom::device::vendor)?,
            product: self.read(eeprom::device::product)?,
            revision: self.read(eeprom::device::revision)?,
            serial: self.read(eeprom::device::serial_number)?,
        };
        let write = Buffer {
            address: self.read(eeprom::mailbox::receive_offset)?,
            size: self.read(eeprom::mailbox::receive_size)?,
        };
        let read = Buffer {
            address: self.read(eeprom::mailbox::send_offset)?,
            size: self.read(eeprom::mailbox::send_size)?,
        };
        let protocols = self.read(eeprom::mailbox::protocols)?;
        let mut info = SlaveInformation {
            identity,
            mailbox: (write.size != 0 && read.size != 0).then_some((write, read)),
            protocols,
            outputs: Buffer {address: 0, size: 0},
            inputs: Buffer {address: 0, size: 0},
            name: String::new(),
        };

        let categories = self.categories()?;
        let strings = categories.iter()
            .find(|category| category.ty == CategoryType::Strings)
            .map(|category| parse_strings(&category.data))
            .transpose()?
            .unwrap_or_default();
        for category in categories.iter() {
            match category.ty {
                CategoryType::General => {
                    let index = *category.data.get(GENERAL_NAME)
                        .ok_or(EthercatError::Protocol("truncated sii general category"))?;
                    // string indices start at 1, 0 means no string
                    if let Some(name) = usize::from(index).checked_sub(1).and_then(|i| strings.get(i)) {
                        info.name = name.clone();
                    }
                },
                CategoryType::SyncManager => {
                    let mut cursor = Cursor::new(category.data.as_slice());
                    while cursor.remaining() >= CategorySyncManager::packed_size() {
                        let channel = cursor.unpack::<CategorySyncManager>()?;
                        let buffer = Buffer {address: channel.address(), size: channel.length()};
                        match SyncManagerUsage::from(channel.usage()) {
                            SyncManagerUsage::ProcessOut => info.outputs = buffer,
                            SyncManagerUsage::ProcessIn => info.inputs = buffer,
                            _ => {},
                        }
                    }
                },
                _ => {},
            }
        }
        Ok(info)
    }
}

/// parse the strings category: a count, then each string prefixed by its length
pub fn parse_strings(data: &[u8]) -> EthercatResult<Vec<String>> {
    let mut cursor = Cursor::new(data);
    let count = cursor.unpack::<u8>()?;
    let mut strings = Vec::with_capacity(usize::from(count));
    for _ in 0 .. count {
        let len = cursor.unpack::<u8>()?;
        let text = cursor.read(usize::from(len))?;
        strings.push(String::from_utf8_lossy(text).into_owned());
    }
    Ok(strings)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_category() {
        let data = [2, 3, b'f', b'o', b'o', 4, b'b', b'a', b'r', b's', 0];
        assert_eq!(parse_strings(&data).unwrap(), ["foo", "bars"]);
        assert!(parse_strings(&[2, 3, b'f']).is_err());
    }

    #[test]
    fn category_layout() {
        let header = CategoryHeader::unpack(&[41, 0, 16, 0]).unwrap();
        assert_eq!(CategoryType::from(header.category().value()), CategoryType::SyncManager);
        assert_eq!(header.size(), 16);

        let channel = CategorySyncManager::unpack(&[0x00, 0x11, 4, 0, 0x24, 0, 1, 3]).unwrap();
        assert_eq!(channel.address(), 0x1100);
        assert_eq!(channel.length(), 4);
        assert_eq!(SyncManagerUsage::from(channel.usage()), SyncManagerUsage::ProcessOut);
    }
}

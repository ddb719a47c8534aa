/*!
    binary codec for ethercat frames and the PDUs (datagrams) they carry, as described in ETG.1000.4

    A frame is an ethercat header followed by a sequence of PDUs. Each PDU is a header, its data, and a footer with the working counter incremented by every slave processing it.

    ```text
    | ethercat header (2) | pdu header (10) | data (len) | working count (2) | pdu header ... |
    ```

    Encoding and decoding have no side effect, the wire I/O is done by [crate::rawmaster::RawMaster]
*/

use bilge::prelude::*;
use crate::{
    data::{self, PduData, Cursor},
    error::{EthercatError, EthercatResult},
    };

/// byte size of the ethercat frame header
pub const ETHERCAT_HEADER: usize = 2;
/// byte size of a PDU header
pub const PDU_HEADER: usize = 10;
/// byte size of a PDU footer (the working counter)
pub const PDU_FOOTER: usize = 2;
/// maximum body of an ethercat frame carried by an ethernet frame (MTU minus the ethercat header)
pub const MAX_FRAME_BODY: usize = 1498;
/// maximum data in one PDU, the length field is 11 bits
pub const MAX_PDU_DATA: usize = 0x7ff;


/// first word of every ethercat frame, whatever the medium
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct EthercatHeader {
    /// byte size of what follows the header
    pub len: u11,
    reserved: u1,
    /// frame type, code of [EthercatType]
    pub ty: u4,
}
data::bilge_pdudata!(EthercatHeader, u16);

/// content announced by [EthercatHeader::ty], this master only sends and accepts PDU frames
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum EthercatType {
    /// a sequence of PDUs, mailboxes included
    PDU = 0x1,
    NetworkVariable = 0x4,
    /// mailbox gateway communication, between the master and non-slave devices
    Mailbox = 0x5,
}

/// the length field of a PDU header, with its flags
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
struct PduLength {
    /// data length following the header, excluding the footer
    len: u11,
    reserved: u3,
    /// true if the frame already went through the ring once
    circulating: bool,
    /// true if there is an other PDU in the same frame
    next: bool,
}
data::bilge_pdudata!(PduLength, u16);

/**
    command code of a PDU

    The prefix is the addressing mode: `AP` by position in the ring, `FP` by configured station, `B` for every slave, `L` in the logical memory. The suffix is the access: `RD` read, `WR` write, `RW` both in the same pass. `ARMW` and `FRMW` read one slave and write the value to all the following ones.
*/
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
#[repr(u8)]
pub enum PduCommand {
    #[default]
    NOP = 0x0,
    APRD = 0x01, APWR = 0x02, APRW = 0x03,
    FPRD = 0x04, FPWR = 0x05, FPRW = 0x06,
    BRD = 0x07, BWR = 0x08, BRW = 0x09,
    LRD = 0x0A, LWR = 0x0B, LRW = 0x0C,
    ARMW = 0x0D, FRMW = 0x0E,
}
impl TryFrom<u8> for PduCommand {
    type Error = EthercatError;
    fn try_from(code: u8) -> EthercatResult<Self> {
        use PduCommand::*;
        Ok(match code {
            0x00 => NOP,
            0x01 => APRD, 0x02 => APWR, 0x03 => APRW,
            0x04 => FPRD, 0x05 => FPWR, 0x06 => FPRW,
            0x07 => BRD, 0x08 => BWR, 0x09 => BRW,
            0x0A => LRD, 0x0B => LWR, 0x0C => LRW,
            0x0D => ARMW, 0x0E => FRMW,
            _ => return Err(EthercatError::MalformedFrame("unknown pdu command")),
        })
    }
}
impl PduCommand {
    /// true if the command addresses the logical memory
    pub fn is_logical(self) -> bool {
        matches!(self, Self::LRD | Self::LWR | Self::LRW)
    }
}

/// one addressed command in a frame
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Pdu {
    pub command: PduCommand,
    /// PDU task request identifier, used by the master to match answers
    pub token: u8,
    /// slave address, its meaning depend on the command. For logical commands, it is the low half of the logical address
    pub slave_address: u16,
    /// memory address of the data to access. For logical commands, it is the high half of the logical address
    pub memory_address: u16,
    pub circulating: bool,
    pub interrupt: u16,
    pub data: Vec<u8>,
    /// incremented by every slave processing the command
    pub working_count: u16,
}

impl Pdu {
    /// PDU addressing physical memory
    pub fn new(command: PduCommand, slave_address: u16, memory_address: u16, data: Vec<u8>) -> Self {
        Self {command, slave_address, memory_address, data, .. Default::default()}
    }
    /// PDU addressing the logical memory at the given 32 bits address
    pub fn logical(command: PduCommand, address: u32, data: Vec<u8>) -> Self {
        Self::new(command, address as u16, (address >> 16) as u16, data)
    }
    /// logical address for logical commands
    pub fn logical_address(&self) -> u32 {
        u32::from(self.slave_address) | (u32::from(self.memory_address) << 16)
    }
    /// bytes taken by this PDU in a frame
    pub fn wire_size(&self) -> usize {
        PDU_HEADER + self.data.len() + PDU_FOOTER
    }

    fn pack(&self, cursor: &mut Cursor<&mut [u8]>, next: bool) -> EthercatResult {
        let mut length = PduLength::from(0u16);
        length.set_len(u11::new(self.data.len() as u16));
        length.set_circulating(self.circulating);
        length.set_next(next);

        cursor.pack(&(self.command as u8))?;
        cursor.pack(&self.token)?;
        cursor.pack(&self.slave_address)?;
        cursor.pack(&self.memory_address)?;
        cursor.pack(&length)?;
        cursor.pack(&self.interrupt)?;
        cursor.write(&self.data)?;
        cursor.pack(&self.working_count)?;
        Ok(())
    }
}

/// a sequence of PDUs sent in one ethernet frame
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Frame {
    pub pdus: Vec<Pdu>,
}

impl Frame {
    pub fn new() -> Self  {Self::default()}
    pub fn with(pdus: Vec<Pdu>) -> Self  {Self {pdus}}

    /// body length, as written in the ethercat header
    pub fn body_size(&self) -> usize {
        self.pdus.iter().map(Pdu::wire_size).sum()
    }
    /// total encoded length, header included
    pub fn encoded_size(&self) -> usize {
        ETHERCAT_HEADER + self.body_size()
    }
    /// true if a PDU with `data` bytes still fits in this frame
    pub fn fits(&self, data: usize) -> bool {
        self.body_size() + PDU_HEADER + data + PDU_FOOTER <= MAX_FRAME_BODY
    }

    /**
        serialize the frame, starting from the ethercat header

        The `next` flags are set from the PDU sequence. Fails if the frame is empty or does not fit in one ethernet frame.
    */
    pub fn encode(&self) -> EthercatResult<Vec<u8>> {
        if self.pdus.is_empty()
            {return Err(EthercatError::Master("cannot encode a frame without pdu"))}
        if self.pdus.iter().any(|pdu| pdu.data.len() > MAX_PDU_DATA)
            {return Err(EthercatError::Master("pdu data exceeds the length field"))}
        let body = self.body_size();
        if body > MAX_FRAME_BODY
            {return Err(EthercatError::Master("frame exceeds an ethernet payload"))}

        let mut raw = vec![0; ETHERCAT_HEADER + body];
        let mut cursor = Cursor::new(raw.as_mut_slice());
        let mut header = EthercatHeader::from(0u16);
        header.set_len(u11::new(body as u16));
        header.set_ty(u4::new(EthercatType::PDU as u8));
        cursor.pack(&header)?;
        for (i, pdu) in self.pdus.iter().enumerate() {
            pdu.pack(&mut cursor, i+1 < self.pdus.len())?;
        }
        Ok(raw)
    }

    /**
        parse a frame, starting from the ethercat header

        Bytes after the body declared by the header are ignored (ethernet padding).

        - [EthercatError::MalformedFrame] is returned if the frame is truncated, is not a PDU frame or contains an unknown command
        - [EthercatError::LengthMismatch] is returned if the PDUs lengths do not sum to the body length declared in the header
    */
    pub fn decode(raw: &[u8]) -> EthercatResult<Self> {
        if raw.len() < ETHERCAT_HEADER
            {return Err(EthercatError::MalformedFrame("truncated ethercat header"))}
        let header = EthercatHeader::unpack(raw)?;
        if header.ty().value() != EthercatType::PDU as u8
            {return Err(EthercatError::MalformedFrame("not a pdu frame"))}
        let declared = usize::from(header.len().value());
        let body = raw.get(ETHERCAT_HEADER .. ETHERCAT_HEADER + declared)
            .ok_or(EthercatError::MalformedFrame("frame shorter than its declared length"))?;

        let mut pdus = Vec::new();
        let mut cursor = Cursor::new(body);
        loop {
            let consumed = cursor.position();
            if cursor.remaining() < PDU_HEADER
                {return Err(EthercatError::LengthMismatch {declared, actual: consumed + PDU_HEADER})}
            let command = PduCommand::try_from(cursor.unpack::<u8>()?)?;
            let token = cursor.unpack::<u8>()?;
            let slave_address = cursor.unpack::<u16>()?;
            let memory_address = cursor.unpack::<u16>()?;
            let length = cursor.unpack::<PduLength>()?;
            let interrupt = cursor.unpack::<u16>()?;
            let len = usize::from(length.len().value());
            if cursor.remaining() < len + PDU_FOOTER
                {return Err(EthercatError::LengthMismatch {declared, actual: consumed + PDU_HEADER + len + PDU_FOOTER})}
            let data = cursor.read(len)?.to_vec();
            let working_count = cursor.unpack::<u16>()?;

            pdus.push(Pdu {
                command,
                token,
                slave_address,
                memory_address,
                circulating: length.circulating(),
                interrupt,
                data,
                working_count,
            });
            if ! length.next() {break}
        }
        if cursor.position() != declared
            {return Err(EthercatError::LengthMismatch {declared, actual: cursor.position()})}
        Ok(Self {pdus})
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Frame {
        Frame::with(vec![
            Pdu {
                command: PduCommand::APRD,
                token: 3,
                slave_address: 0xfffe,
                memory_address: 0x0130,
                data: vec![0; 2],
                working_count: 1,
                .. Default::default()
            },
            Pdu::logical(PduCommand::LRW, 0x0001_0000, vec![1, 2, 3, 4, 5]),
            Pdu {
                command: PduCommand::FPWR,
                token: 200,
                slave_address: 0x1001,
                memory_address: 0x0120,
                circulating: true,
                interrupt: 0x00f0,
                data: vec![0x08],
                working_count: 0,
            },
        ])
    }

    #[test]
    fn round_trip() {
        let frame = sample();
        let raw = frame.encode().unwrap();
        assert_eq!(Frame::decode(&raw).unwrap(), frame);

        let single = Frame::with(vec![Pdu::new(PduCommand::BRD, 0, 0, vec![])]);
        assert_eq!(Frame::decode(&single.encode().unwrap()).unwrap(), single);
    }

    #[test]
    fn wire_layout() {
        let frame = Frame::with(vec![Pdu::new(PduCommand::FPRD, 0x1001, 0x0130, vec![0xaa, 0xbb])]);
        let raw = frame.encode().unwrap();
        assert_eq!(raw, [
            // header: length 14, type 1
            0x0e, 0x10,
            0x04, 0x00, 0x01, 0x10, 0x30, 0x01,
            // length 2, no next flag
            0x02, 0x00,
            0x00, 0x00,
            0xaa, 0xbb,
            0x00, 0x00,
            ]);
        let logical = Pdu::logical(PduCommand::LRW, 0x0102_0304, vec![]);
        assert_eq!(logical.slave_address, 0x0304);
        assert_eq!(logical.memory_address, 0x0102);
        assert_eq!(logical.logical_address(), 0x0102_0304);
    }

    #[test]
    fn lengths_sum_to_frame() {
        let frame = sample();
        let raw = frame.encode().unwrap();
        let decoded = Frame::decode(&raw).unwrap();
        let sum: usize = decoded.pdus.iter()
            .map(|pdu| PDU_HEADER + pdu.data.len() + PDU_FOOTER)
            .sum();
        assert_eq!(sum + ETHERCAT_HEADER, raw.len());
    }

    #[test]
    fn padding_is_ignored() {
        let frame = sample();
        let mut raw = frame.encode().unwrap();
        raw.resize(raw.len() + 20, 0);
        assert_eq!(Frame::decode(&raw).unwrap(), frame);
    }

    #[test]
    fn length_mismatch() {
        let raw = sample().encode().unwrap();

        // header declares more than the datagrams use
        let mut longer = raw.clone();
        let declared = (u16::from_le_bytes([longer[0], longer[1]]) & 0x7ff) + 4;
        longer[.. 2].copy_from_slice(&(declared | 0x1000).to_le_bytes());
        longer.extend_from_slice(&[0; 4]);
        assert!(matches!(Frame::decode(&longer),
            Err(EthercatError::LengthMismatch {declared: d, ..}) if d == usize::from(declared)));

        // a datagram overruns the declared body
        let mut overrun = raw.clone();
        overrun[2 + 6] = 0xff;
        overrun[2 + 7] |= 0x07;
        assert!(matches!(Frame::decode(&overrun), Err(EthercatError::LengthMismatch {..})));

        // the last datagram still announces a next one
        let mut next = raw.clone();
        let last = raw.len() - PDU_FOOTER - 1 - PDU_HEADER + 7;
        next[last] |= 0x80;
        assert!(matches!(Frame::decode(&next), Err(EthercatError::LengthMismatch {..})));
    }

    #[test]
    fn malformed() {
        assert!(matches!(Frame::decode(&[0x0e]), Err(EthercatError::MalformedFrame(_))));
        // mailbox frame type
        assert!(matches!(Frame::decode(&[0x00, 0x50]), Err(EthercatError::MalformedFrame(_))));
        let raw = sample().encode().unwrap();
        assert!(matches!(Frame::decode(&raw[.. raw.len()-3]), Err(EthercatError::MalformedFrame(_))));
        let mut unknown = raw.clone();
        unknown[2] = 0x42;
        assert!(matches!(Frame::decode(&unknown), Err(EthercatError::MalformedFrame(_))));
    }

    #[test]
    fn frame_limits() {
        assert!(Frame::new().encode().is_err());
        let big = Frame::with(vec![Pdu::new(PduCommand::LRW, 0, 0, vec![0; MAX_FRAME_BODY])]);
        assert!(big.encode().is_err());
        let mut frame = Frame::new();
        assert!(frame.fits(MAX_FRAME_BODY - PDU_HEADER - PDU_FOOTER));
        frame.pdus.push(Pdu::new(PduCommand::LRW, 0, 0, vec![0; 1000]));
        assert!(! frame.fits(500));
    }
}

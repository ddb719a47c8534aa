/*!
    implementation of CoE (Canopen Over Ethercat) SDO transfers

    It works exactly as in a Can bus, except each of its frame is encapsulated in an ethercat mailbox frame.

    Canopen protocol exposes a dictionnary of simple values or single level structures, for non-realtime access. These are named SDO (Service Data Object). Depending on the size of the value, a transfer is

    - **expedited**: up to 4 bytes, the value is in the initiate request (write) or answer (read)
    - **normal**: the value follows the initiate request or answer, with its total size, when it fits in the mailbox
    - **segmented**: a normal transfer continued by segments, each acknowledged before the next one is sent. Consecutive segments have alternating toggle bits.

    [SdoTransfer] only builds requests and interprets answers, it does not access the bus. Sending is done by [crate::sdo::SdoEngine].

    ETG.1000.6 5.6.2
*/

use bilge::prelude::*;
use crate::{
	data::{self, PduData, Cursor},
	error::{EthercatError, EthercatResult},
	};


/// maximum byte size of sdo data that can be expedited
pub const EXPEDITED_MAX_SIZE: usize = 4;
/// size of the data area of the shortest segment
pub const SEGMENT_MIN_DATA: usize = 7;
/// byte size of the CoE header
pub const COE_HEADER: usize = 2;
/// byte size of the SDO initiate header
pub const SDO_HEADER: usize = 4;
/// byte size of the SDO segment header
pub const SDO_SEGMENT_HEADER: usize = 1;


#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct CoeHeader {
    /// PDO number, zero for SDO services
    pub number: u9,
    reserved: u3,
    /// code of [CanService]
    pub service: u4,
}
data::bilge_pdudata!(CoeHeader, u16);

impl CoeHeader {
    pub fn service_header(service: CanService) -> Self {
        let mut header = Self::from(0u16);
        header.set_service(u4::new(u8::from(service) & 0x0f));
        header
    }
    pub fn can_service(&self) -> CanService {
        CanService::from(self.service().value())
    }
}

data::code_enum!{
/// service carried by a CoE message, `Transmit` and `Receive` are named from the slave side
pub enum CanService: u8 {
    Emergency = 0x1,
    SdoRequest = 0x2,
    SdoResponse = 0x3,
    TransmitPdo = 0x4,
    ReceivePdo = 0x5,
    TransmitPdoRemoteRequest = 0x6,
    ReceivePdoRemoteRequest = 0x7,
    SdoInformation = 0x8,
}
}

/// first 4 bytes of an SDO initiate request or response, addressing the object
#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct SdoHeader {
    /// the size is given, in `size` for expedited transfers or in the following 4 bytes otherwise
    pub sized: bool,
    /// the data fits in the 4 bytes following the header
    pub expedited: bool,
    /// unused bytes among the 4 expedited bytes
    pub size: u2,
    /// all subindices at once
    pub complete: bool,
    /// code of [SdoCommandRequest] or [SdoCommandResponse]
    pub command: u3,
    pub index: u16,
    pub sub: u8,
}
data::bilge_pdudata!(SdoHeader, u32);

impl SdoHeader {
    /// header with only the command and the addressed object set
    pub fn addressing(command: u8, index: u16, sub: u8) -> Self {
        let mut header = Self::from(0u32);
        header.set_command(u3::new(command));
        header.set_index(index);
        header.set_sub(sub);
        header
    }
}

#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct SdoSegmentHeader {
    /// true if this is the last segment of the transfer
    pub last: bool,
    /// number of unused bytes in a minimal (7 bytes) segment
    pub size: u3,
    pub toggle: bool,
    pub command: u3,
}
data::bilge_pdudata!(SdoSegmentHeader, u8);

impl SdoSegmentHeader {
    pub fn segment(command: u8, toggle: bool, last: bool, len: usize) -> Self {
        let mut header = Self::from(0u8);
        header.set_command(u3::new(command));
        header.set_toggle(toggle);
        header.set_last(last);
        if len < SEGMENT_MIN_DATA {
            header.set_size(u3::new((SEGMENT_MIN_DATA - len) as u8));
        }
        header
    }
}

/// command specifier sent by the master
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum SdoCommandRequest {
    Download = 0x1,
    DownloadSegment = 0x0,
    Upload = 0x2,
    UploadSegment = 0x3,
    Abort = 0x4,
}

/// command specifier answered by the slave, the same operation has a different code than in requests
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum SdoCommandResponse {
    Download = 0x3,
    DownloadSegment = 0x1,
    Upload = 0x2,
    UploadSegment = 0x0,
    Abort = 0x4,
}

data::code_enum!{
/// reason given by a slave for aborting an SDO transfer
pub enum SdoAbortCode: u32 {
    BadToggle = 0x05_03_00_00,
    Timeout = 0x05_04_00_00,
    UnsupportedCommand = 0x05_04_00_01,
    OutOfMemory = 0x05_04_00_05,
    /// also answered to complete access on slaves not supporting it
    UnsupportedAccess = 0x06_01_00_00,
    WriteOnly = 0x06_01_00_01,
    ReadOnly = 0x06_01_00_02,
    /// subindex 0 must be cleared before writing the others
    WriteError = 0x06_01_00_03,
    ObjectTooBig = 0x06_01_00_05,
    /// the object is mapped in a PDO
    LockedByPdo = 0x06_01_00_06,
    InvalidIndex = 0x06_02_00_00,
    CannotMap = 0x06_04_00_41,
    PdoTooSmall = 0x06_04_00_42,
    HardwareError = 0x06_06_00_00,
    InvalidLength = 0x06_07_00_10,
    ServiceTooBig = 0x06_07_00_12,
    ServiceTooSmall = 0x06_07_00_13,
    InvalidSubIndex = 0x06_09_00_11,
    ValueOutOfRange = 0x06_09_00_30,
    GeneralError = 0x08_00_00_00,
    Refused = 0x08_00_00_20,
    /// refused in the current AL state of the slave
    StateRefused = 0x08_00_00_22,
}
}

/// outcome of an answer received during a transfer
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Progress {
    /// the transfer needs more requests, [SdoTransfer::request] gives the next one
    Continue,
    /// the transfer is finished, with the read value (empty for writes)
    Done(Vec<u8>),
}

#[derive(Clone, Debug)]
enum Direction {
    Read {
        received: Vec<u8>,
        total: usize,
    },
    Write {
        data: Vec<u8>,
        sent: usize,
    },
}

/**
    state of one SDO transfer between the master (client) and a slave (server)

    The transfer alternates between [Self::request] which gives the CoE payload to put in the mailbox, and [Self::receive] which processes the CoE payload answered by the slave.
*/
#[derive(Clone, Debug)]
pub struct SdoTransfer {
    index: u16,
    sub: u8,
    direction: Direction,
    /// false while the initiate request is not acknowledged
    segmented: bool,
    toggle: bool,
    /// bytes of the current write request, committed when acknowledged
    pending: usize,
    /// maximum CoE payload in the mailbox
    capacity: usize,
}

impl SdoTransfer {
    /// transfer reading a value, with `capacity` the maximum CoE payload in the slave's mailbox
    pub fn read(index: u16, sub: u8, capacity: usize) -> Self {
        Self {
            index, sub, capacity,
            direction: Direction::Read {received: Vec::new(), total: 0},
            segmented: false,
            toggle: false,
            pending: 0,
        }
    }
    /// transfer writing a value, with `capacity` the maximum CoE payload in the slave's mailbox
    pub fn write(index: u16, sub: u8, data: Vec<u8>, capacity: usize) -> Self {
        Self {
            index, sub, capacity,
            direction: Direction::Write {data, sent: 0},
            segmented: false,
            toggle: false,
            pending: 0,
        }
    }
    pub fn index(&self) -> u16  {self.index}
    pub fn sub(&self) -> u8  {self.sub}

    /// CoE payload of the next request to send
    pub fn request(&mut self) -> EthercatResult<Vec<u8>> {
        let mut frame = vec![0; self.capacity];
        let mut cursor = Cursor::new(frame.as_mut_slice());
        cursor.pack(&CoeHeader::service_header(CanService::SdoRequest))?;

        match (&self.direction, self.segmented) {
            (Direction::Read {..}, false) => {
                cursor.pack(&SdoHeader::addressing(SdoCommandRequest::Upload as u8, self.index, self.sub))?;
                cursor.write(&[0; 4])?;
            },
            (Direction::Read {..}, true) => {
                cursor.pack(&SdoSegmentHeader::segment(SdoCommandRequest::UploadSegment as u8, self.toggle, false, SEGMENT_MIN_DATA))?;
                cursor.write(&[0; SEGMENT_MIN_DATA])?;
            },
            (Direction::Write {data, ..}, false) => {
                if data.is_empty()
                    {return Err(EthercatError::Master("sdo write needs at least one byte"))}
                let mut header = SdoHeader::addressing(SdoCommandRequest::Download as u8, self.index, self.sub);
                header.set_sized(true);
                if data.len() <= EXPEDITED_MAX_SIZE {
                    header.set_expedited(true);
                    header.set_size(u2::new((EXPEDITED_MAX_SIZE - data.len()) as u8));
                    cursor.pack(&header)?;
                    cursor.write(data)?;
                    cursor.write(&[0; EXPEDITED_MAX_SIZE][data.len() ..])?;
                    self.pending = data.len();
                }
                else {
                    let total = u32::try_from(data.len())
                        .map_err(|_| EthercatError::Master("sdo value too big"))?;
                    cursor.pack(&header)?;
                    cursor.pack(&total)?;
                    let chunk = data.len().min(cursor.remaining());
                    cursor.write(&data[.. chunk])?;
                    self.pending = chunk;
                }
            },
            (Direction::Write {data, sent}, true) => {
                let chunk = (data.len() - sent).min(self.capacity - COE_HEADER - SDO_SEGMENT_HEADER);
                let last = sent + chunk == data.len();
                cursor.pack(&SdoSegmentHeader::segment(SdoCommandRequest::DownloadSegment as u8, self.toggle, last, chunk))?;
                cursor.write(&data[*sent ..][.. chunk])?;
                if chunk < SEGMENT_MIN_DATA {
                    cursor.write(&[0; SEGMENT_MIN_DATA][chunk ..])?;
                }
                self.pending = chunk;
            },
        }
        let size = cursor.position();
        frame.truncate(size);
        Ok(frame)
    }

    /// CoE payload aborting this transfer, to send when the master gives up
    pub fn abort(&self, code: SdoAbortCode) -> EthercatResult<Vec<u8>> {
        let mut frame = vec![0; COE_HEADER + SDO_HEADER + 4];
        let mut cursor = Cursor::new(frame.as_mut_slice());
        cursor.pack(&CoeHeader::service_header(CanService::SdoRequest))?;
        cursor.pack(&SdoHeader::addressing(SdoCommandRequest::Abort as u8, self.index, self.sub))?;
        cursor.pack(&u32::from(code))?;
        Ok(frame)
    }

    /**
        process the CoE payload answered by the slave to the last request

        - [EthercatError::SdoAborted] if the slave aborted the transfer
        - [EthercatError::Protocol] if the answer does not fit the transfer
    */
    pub fn receive(&mut self, payload: &[u8]) -> EthercatResult<Progress> {
        let mut frame = Cursor::new(payload);
        let service = frame.unpack::<CoeHeader>()?.can_service();
        // aborts are initiate headers in both directions
        if let Some(code) = Self::aborted(service, frame.remain())? {
            return Err(EthercatError::SdoAborted(code));
        }
        if service != CanService::SdoResponse
            {return Err(EthercatError::Protocol("unexpected COE service during SDO operation"))}

        if ! self.segmented {
            let header = frame.unpack::<SdoHeader>()?;
            if header.index() != self.index   {return Err(EthercatError::Protocol("slave answered about wrong item"))}
            if header.sub() != self.sub   {return Err(EthercatError::Protocol("slave answered about wrong subitem"))}

            match &mut self.direction {
                Direction::Read {received, total} => {
                    if header.command().value() != SdoCommandResponse::Upload as u8
                        {return Err(EthercatError::Protocol("slave answered with wrong operation"))}
                    if header.expedited() {
                        let size = if header.sized()
                            {EXPEDITED_MAX_SIZE - usize::from(header.size().value())}
                            else {EXPEDITED_MAX_SIZE};
                        return Ok(Progress::Done(frame.read(size)?.to_vec()));
                    }
                    *total = frame.unpack::<u32>()? as usize;
                    let data = frame.remain();
                    received.extend_from_slice(&data[.. data.len().min(*total)]);
                    if received.len() >= *total {
                        return Ok(Progress::Done(core::mem::take(received)));
                    }
                    self.segmented = true;
                    Ok(Progress::Continue)
                },
                Direction::Write {data, sent} => {
                    if header.command().value() != SdoCommandResponse::Download as u8
                        {return Err(EthercatError::Protocol("slave answered with wrong operation"))}
                    *sent += self.pending;
                    if *sent >= data.len() {
                        return Ok(Progress::Done(Vec::new()));
                    }
                    self.segmented = true;
                    Ok(Progress::Continue)
                },
            }
        }
        else {
            let header = frame.unpack::<SdoSegmentHeader>()?;
            if header.toggle() != self.toggle
                {return Err(EthercatError::Protocol("bad toggle bit in segment received"))}
            self.toggle = ! self.toggle;

            match &mut self.direction {
                Direction::Read {received, total} => {
                    if header.command().value() != SdoCommandResponse::UploadSegment as u8
                        {return Err(EthercatError::Protocol("slave answered with wrong operation"))}
                    let data = frame.remain();
                    let size = if data.len() == SEGMENT_MIN_DATA
                        {SEGMENT_MIN_DATA - usize::from(header.size().value())}
                        else {data.len()};
                    let size = size.min(*total - received.len());
                    received.extend_from_slice(&data[.. size]);
                    if header.last() || received.len() >= *total {
                        return Ok(Progress::Done(core::mem::take(received)));
                    }
                    Ok(Progress::Continue)
                },
                Direction::Write {data, sent} => {
                    if header.command().value() != SdoCommandResponse::DownloadSegment as u8
                        {return Err(EthercatError::Protocol("slave answered with wrong operation"))}
                    *sent += self.pending;
                    if *sent >= data.len() {
                        return Ok(Progress::Done(Vec::new()));
                    }
                    Ok(Progress::Continue)
                },
            }
        }
    }

    /// abort code if the given SDO payload is an abort
    fn aborted(service: CanService, sdo: &[u8]) -> EthercatResult<Option<SdoAbortCode>> {
        if ! matches!(service, CanService::SdoRequest | CanService::SdoResponse)
            {return Ok(None)}
        let mut frame = Cursor::new(sdo);
        let header = frame.unpack::<SdoHeader>()?;
        if header.command().value() != SdoCommandRequest::Abort as u8
            {return Ok(None)}
        Ok(Some(SdoAbortCode::from(frame.unpack::<u32>()?)))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    /// build an answer as a slave would
    fn answer(header: impl PduData, data: &[u8]) -> Vec<u8> {
        let mut frame = vec![0; COE_HEADER + header_size::<SdoHeader>() + 16];
        let mut cursor = Cursor::new(frame.as_mut_slice());
        cursor.pack(&CoeHeader::service_header(CanService::SdoResponse)).unwrap();
        cursor.pack(&header).unwrap();
        cursor.write(data).unwrap();
        let size = cursor.position();
        frame.truncate(size);
        frame
    }
    fn header_size<T: PduData>() -> usize {T::packed_size()}

    #[test]
    fn expedited_read() {
        let mut transfer = SdoTransfer::read(0x6041, 0, 122);
        let request = transfer.request().unwrap();
        assert_eq!(request, [0x00, 0x20, 0x40, 0x41, 0x60, 0x00, 0, 0, 0, 0]);

        let mut header = SdoHeader::addressing(SdoCommandResponse::Upload as u8, 0x6041, 0);
        header.set_sized(true);
        header.set_expedited(true);
        header.set_size(u2::new(2));
        assert_eq!(
            transfer.receive(&answer(header, &[0x37, 0x02, 0, 0])).unwrap(),
            Progress::Done(vec![0x37, 0x02]),
            );
    }

    #[test]
    fn expedited_write() {
        let mut transfer = SdoTransfer::write(0x6040, 0, vec![0x0f, 0x00], 122);
        let request = transfer.request().unwrap();
        // sized, expedited, 2 unused bytes, download
        assert_eq!(request, [0x00, 0x20, 0x2b, 0x40, 0x60, 0x00, 0x0f, 0x00, 0, 0]);
        let header = SdoHeader::addressing(SdoCommandResponse::Download as u8, 0x6040, 0);
        assert_eq!(transfer.receive(&answer(header, &[0; 4])).unwrap(), Progress::Done(vec![]));
    }

    #[test]
    fn empty_write() {
        let mut transfer = SdoTransfer::write(0x6040, 0, Vec::new(), 122);
        assert!(matches!(transfer.request(), Err(EthercatError::Master(_))));
    }

    #[test]
    fn segmented_write() {
        let data: Vec<u8> = (0 .. 30).collect();
        // very small mailbox: 16 bytes of CoE payload
        let mut transfer = SdoTransfer::write(0x2000, 1, data.clone(), 16);

        let request = transfer.request().unwrap();
        assert_eq!(request.len(), 16);
        assert_eq!(&request[6 .. 10], &30u32.to_le_bytes());
        assert_eq!(&request[10 ..], &data[.. 6]);
        let header = SdoHeader::addressing(SdoCommandResponse::Download as u8, 0x2000, 1);
        assert_eq!(transfer.receive(&answer(header, &[0; 4])).unwrap(), Progress::Continue);

        let mut toggle = false;
        let mut sent = 6;
        loop {
            let request = transfer.request().unwrap();
            let segment = SdoSegmentHeader::unpack(&request[2 ..]).unwrap();
            assert_eq!(segment.toggle(), toggle);
            let chunk = (request.len() - 3).min(30 - sent);
            assert_eq!(&request[3 ..][.. chunk], &data[sent ..][.. chunk]);
            sent += chunk;
            assert_eq!(segment.last(), sent == 30);

            let ack = SdoSegmentHeader::segment(SdoCommandResponse::DownloadSegment as u8, toggle, false, 7);
            match transfer.receive(&answer(ack, &[0; 7])).unwrap() {
                Progress::Continue => {},
                Progress::Done(_) => break,
            }
            toggle = ! toggle;
        }
        assert_eq!(sent, 30);
    }

    #[test]
    fn segmented_read() {
        let mut transfer = SdoTransfer::read(0x1008, 0, 122);
        transfer.request().unwrap();
        let mut header = SdoHeader::addressing(SdoCommandResponse::Upload as u8, 0x1008, 0);
        header.set_sized(true);
        let mut first = 12u32.to_le_bytes().to_vec();
        first.extend_from_slice(b"long");
        assert_eq!(transfer.receive(&answer(header, &first)).unwrap(), Progress::Continue);

        let request = transfer.request().unwrap();
        assert_eq!(request, [0x00, 0x20, 0x60, 0, 0, 0, 0, 0, 0, 0]);
        let segment = SdoSegmentHeader::segment(SdoCommandResponse::UploadSegment as u8, false, false, 7);
        assert_eq!(transfer.receive(&answer(segment, b" device")).unwrap(), Progress::Continue);

        let request = transfer.request().unwrap();
        assert_eq!(request[2], 0x70);
        let segment = SdoSegmentHeader::segment(SdoCommandResponse::UploadSegment as u8, true, true, 1);
        assert_eq!(
            transfer.receive(&answer(segment, b"s\0\0\0\0\0\0")).unwrap(),
            Progress::Done(b"long devices".to_vec()),
            );
    }

    #[test]
    fn abort_and_toggle() {
        let mut transfer = SdoTransfer::read(0x1234, 5, 122);
        transfer.request().unwrap();
        let header = SdoHeader::addressing(SdoCommandRequest::Abort as u8, 0x1234, 5);
        let mut abort = answer(header, &0x0602_0000u32.to_le_bytes());
        abort[1] = 0x20;
        assert!(matches!(
            transfer.receive(&abort),
            Err(EthercatError::SdoAborted(SdoAbortCode::InvalidIndex)),
            ));

        let mut transfer = SdoTransfer::read(0x1008, 0, 122);
        let mut header = SdoHeader::addressing(SdoCommandResponse::Upload as u8, 0x1008, 0);
        header.set_sized(true);
        let mut first = 20u32.to_le_bytes().to_vec();
        first.extend_from_slice(b"abc");
        transfer.receive(&answer(header, &first)).unwrap();
        let segment = SdoSegmentHeader::segment(SdoCommandResponse::UploadSegment as u8, true, false, 7);
        assert!(matches!(transfer.receive(&answer(segment, &[0; 7])), Err(EthercatError::Protocol(_))));
    }
}

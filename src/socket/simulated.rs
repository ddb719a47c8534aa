/*!
    ethercat segment simulated in the same process

    [SimulatedBus] implements [EthercatSocket]: every frame sent is processed by the simulated slaves in bus order, and its modified version is queued for reception, exactly as a real segment would echo it.

    Each [SimulatedSlave] has a physical memory with the registers used by this master, an EEPROM readable through SII, an AL state machine checking the sync manager setup, FMMUs for logical addressing, and a CoE server answering SDO requests in its mailbox. Faults can be injected: disconnection, lost frames, muted mailbox, delayed or repeated mailbox answers, slave ignoring AL requests, lost FMMU setup.
*/

use core::time::Duration;
use std::{
    collections::{BTreeMap, VecDeque},
    io,
    sync::{Arc, Mutex, MutexGuard},
    };
use bilge::prelude::*;
use super::{EthercatSocket, timed_out};
use crate::{
    frame::{Frame, PduCommand, MAX_FRAME_BODY, ETHERCAT_HEADER},
    registers::{self, AlControl, AlError, AlState, AlStatus, SyncManagerChannel, SyncMode},
    mailbox::{Buffer, MailboxHeader, MailboxType, MAILBOX_HEADER},
    can::{self, CanService, CoeHeader, SdoAbortCode, SdoCommandResponse, SdoHeader, SdoSegmentHeader},
    sii::{self, eeprom, CategoryHeader, CategorySyncManager, CategoryType, SyncManagerUsage},
    data::{PduData, PackingResult, Cursor},
    };


/// size of the simulated physical memory
const MEMORY: usize = 0x2000;
const CONTROLLER_TYPE: u8 = 0x11;
const MAILBOX_SIZE: u16 = 128;
const MAILBOX_WRITE: u16 = 0x1000;
const MAILBOX_READ: u16 = 0x1080;
const OUTPUTS: u16 = 0x1100;
const INPUTS: u16 = 0x1180;
const FMMU_ENTRIES: u8 = 4;


/// an object in the dictionnary of a simulated slave
#[derive(Clone, Debug)]
struct Object {
    data: Vec<u8>,
    writable: bool,
}

/// segmented transfer in progress in the CoE server
#[derive(Clone, Debug)]
enum Segmented {
    Upload {
        data: Vec<u8>,
        sent: usize,
        toggle: bool,
    },
    Download {
        index: u16,
        sub: u8,
        total: usize,
        received: Vec<u8>,
        toggle: bool,
    },
}

/**
    description and runtime state of a simulated slave

    It is built with the `with_*` methods, then given to [SimulatedBus::new]. By default a slave has a mailbox of 128 bytes in each direction and no process data.
*/
#[derive(Clone, Debug)]
pub struct SimulatedSlave {
    identity: sii::Identity,
    name: String,
    mailbox: Option<(Buffer, Buffer)>,
    outputs: Buffer,
    inputs: Buffer,
    bootstrap: bool,
    objects: BTreeMap<(u16, u8), Object>,

    memory: Vec<u8>,
    eeprom: Vec<u8>,
    state: AlState,
    connected: bool,
    muted: bool,
    /// answers are kept out of the read buffer until released
    holding: bool,
    /// every answer is sent twice
    duplicating: bool,
    stuck: bool,
    transitions: Vec<AlState>,
    /// mailbox frames waiting to be read by the master, the first one is in the read buffer
    responses: VecDeque<Vec<u8>>,
    held: Vec<Vec<u8>>,
    segmented: Option<Segmented>,
    served: usize,
    overlaps: usize,
}

impl SimulatedSlave {
    pub fn new(vendor: u32, product: u32) -> Self {
        Self {
            identity: sii::Identity {vendor, product, revision: 1, serial: 0},
            name: String::new(),
            mailbox: Some((
                Buffer {address: MAILBOX_WRITE, size: MAILBOX_SIZE},
                Buffer {address: MAILBOX_READ, size: MAILBOX_SIZE},
                )),
            outputs: Buffer {address: OUTPUTS, size: 0},
            inputs: Buffer {address: INPUTS, size: 0},
            bootstrap: false,
            objects: BTreeMap::new(),

            memory: vec![0; MEMORY],
            eeprom: Vec::new(),
            state: AlState::Init,
            connected: true,
            muted: false,
            holding: false,
            duplicating: false,
            stuck: false,
            transitions: Vec::new(),
            responses: VecDeque::new(),
            held: Vec::new(),
            segmented: None,
            served: 0,
            overlaps: 0,
        }
    }
    /// device name given in the EEPROM
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }
    pub fn with_serial(mut self, revision: u32, serial: u32) -> Self {
        self.identity.revision = revision;
        self.identity.serial = serial;
        self
    }
    /// byte sizes of the process data declared by the slave
    pub fn with_process_data(mut self, outputs: u16, inputs: u16) -> Self {
        self.outputs.size = outputs;
        self.inputs.size = inputs;
        self
    }
    /// add an object to the slave's dictionnary
    pub fn with_object(mut self, index: u16, sub: u8, data: &[u8], writable: bool) -> Self {
        self.objects.insert((index, sub), Object {data: data.to_vec(), writable});
        self
    }
    pub fn without_mailbox(mut self) -> Self {
        self.mailbox = None;
        self
    }
    pub fn with_bootstrap(mut self) -> Self {
        self.bootstrap = true;
        self
    }

    /// initial content of the physical memory and EEPROM
    fn power_on(&mut self) {
        self.memory = vec![0; MEMORY];
        self.memory[registers::controller_type.byte] = CONTROLLER_TYPE;
        self.state = AlState::Init;
        self.set_status(false);
        self.eeprom = match self.build_eeprom() {
            Ok(eeprom) => eeprom,
            Err(err) => {
                log::error!("cannot build simulated eeprom: {:?}", err);
                Vec::new()
            },
        };
    }

    fn build_eeprom(&self) -> PackingResult<Vec<u8>> {
        let mut eeprom = vec![0; eeprom::categories];
        eeprom::device::vendor.set(&mut eeprom, self.identity.vendor)?;
        eeprom::device::product.set(&mut eeprom, self.identity.product)?;
        eeprom::device::revision.set(&mut eeprom, self.identity.revision)?;
        eeprom::device::serial_number.set(&mut eeprom, self.identity.serial)?;
        eeprom::version.set(&mut eeprom, 1)?;
        if let Some((write, read)) = self.mailbox {
            eeprom::mailbox::receive_offset.set(&mut eeprom, write.address)?;
            eeprom::mailbox::receive_size.set(&mut eeprom, write.size)?;
            eeprom::mailbox::send_offset.set(&mut eeprom, read.address)?;
            eeprom::mailbox::send_size.set(&mut eeprom, read.size)?;
            let mut protocols = sii::MailboxTypes::from(0u8);
            protocols.set_can(true);
            eeprom::mailbox::protocols.set(&mut eeprom, protocols)?;
        }

        // strings
        let mut strings = vec![u8::from(! self.name.is_empty())];
        if ! self.name.is_empty() {
            let name = &self.name.as_bytes()[.. self.name.len().min(255)];
            strings.push(name.len() as u8);
            strings.extend_from_slice(name);
        }
        push_category(&mut eeprom, CategoryType::Strings, &strings)?;

        // general, only the name index is used
        let mut general = vec![0; 32];
        general[3] = u8::from(! self.name.is_empty());
        push_category(&mut eeprom, CategoryType::General, &general)?;

        // sync managers
        let (write, read) = self.mailbox.unwrap_or((Buffer {address: 0, size: 0}, Buffer {address: 0, size: 0}));
        let mailbox_usage = |usage| if self.mailbox.is_some() {usage} else {SyncManagerUsage::Disabled};
        let mut channels = vec![0; 4 * CategorySyncManager::packed_size()];
        let mut cursor = Cursor::new(channels.as_mut_slice());
        for (buffer, control, usage) in [
                (write, 0x26, mailbox_usage(SyncManagerUsage::MailboxOut)),
                (read, 0x22, mailbox_usage(SyncManagerUsage::MailboxIn)),
                (self.outputs, 0x24, SyncManagerUsage::ProcessOut),
                (self.inputs, 0x20, SyncManagerUsage::ProcessIn),
                ] {
            let mut channel = CategorySyncManager::from(0u64);
            channel.set_address(buffer.address);
            channel.set_length(buffer.size);
            channel.set_control(control);
            channel.set_enable(u8::from(buffer.size != 0));
            channel.set_usage(u8::from(usage));
            cursor.pack(&channel)?;
        }
        push_category(&mut eeprom, CategoryType::SyncManager, &channels)?;

        eeprom.extend_from_slice(&[0xff; 4]);
        Ok(eeprom)
    }

    fn set_status(&mut self, error: bool) {
        let mut status = [0];
        if AlStatus::new_state(self.state, error).pack(&mut status).is_ok() {
            self.memory[registers::al::status.byte] = status[0];
        }
    }
    fn fail_transition(&mut self, requested: AlState, code: AlError) {
        log::debug!("simulated slave refuses {} -> {}: {:?}", self.state, requested, code);
        self.set_status(true);
        let _ = registers::al::error.set(&mut self.memory, code);
    }

    fn station(&self) -> u16 {
        registers::address::fixed.get(&self.memory).unwrap_or(0)
    }
    fn channel(&self, index: u8) -> Option<SyncManagerChannel> {
        registers::sync_manager::interface.channel(index).get(&self.memory).ok()
            .filter(|channel| channel.enable())
    }
    /// mailbox buffers as currently configured in the sync managers
    fn configured_mailbox(&self) -> Option<(Buffer, Buffer)> {
        let mailbox = |index| self.channel(index)
            .filter(|channel| channel.mode().value() == SyncMode::Mailbox as u8)
            .map(|channel| Buffer {address: channel.address(), size: channel.length()});
        Some((mailbox(0)?, mailbox(1)?))
    }

    /// refresh the registers reflecting the slave's internal state
    fn refresh(&mut self) {
        let full = ! self.responses.is_empty();
        // mailbox_full is bit 3 of the status byte
        let status = registers::sync_manager::interface.mailbox_read().byte + 5;
        if full {self.memory[status] |= 0b1000}
        else    {self.memory[status] &= !0b1000}
        let status = registers::sync_manager::interface.mailbox_write().byte + 5;
        self.memory[status] &= !0b1000;
    }

    /// physical memory access, returns the working count increment
    fn physical(&mut self, read: bool, write: bool, address: u16, data: &mut [u8], merge: bool) -> u16 {
        let start = usize::from(address);
        if start + data.len() > self.memory.len()
            {return 0}
        let incoming = data.to_vec();
        let mut count = 0;
        if read && self.read_physical(start, data, merge)
            {count += 1}
        if write && self.write_physical(start, &incoming)
            {count += if read {2} else {1}}
        count
    }

    fn read_physical(&mut self, start: usize, data: &mut [u8], merge: bool) -> bool {
        self.refresh();
        let range = start .. start + data.len();
        let mut consumed = false;
        if let Some((_, read)) = self.configured_mailbox() {
            let buffer = usize::from(read.address) .. usize::from(read.address) + usize::from(read.size);
            if overlaps(&range, &buffer) {
                // handshake buffer cannot be read while empty
                if self.responses.is_empty()
                    {return false}
                consumed = range.contains(&(buffer.end - 1));
            }
        }
        for (dst, src) in data.iter_mut().zip(&self.memory[range]) {
            if merge {*dst |= *src}
            else {*dst = *src}
        }
        if consumed {
            self.responses.pop_front();
            self.load_response();
        }
        true
    }

    fn write_physical(&mut self, start: usize, data: &[u8]) -> bool {
        let range = start .. start + data.len();
        self.memory[range.clone()].copy_from_slice(data);

        if range.contains(&registers::al::control.byte) {
            self.al_control(self.memory[registers::al::control.byte]);
        }
        if range.contains(&(registers::sii::control.byte + 1)) {
            self.sii_operation();
        }
        if let Some((write, _)) = self.configured_mailbox() {
            if write.size != 0 && range.contains(&(usize::from(write.address) + usize::from(write.size) - 1)) {
                self.mailbox_request(write);
            }
        }
        true
    }

    fn al_control(&mut self, value: u8) {
        let control = AlControl::from(value);
        if control.ack() {
            self.set_status(false);
        }
        if self.stuck {
            log::debug!("simulated slave {} ignores AL request", self.station());
            return
        }
        let requested = match AlState::try_from(control.state().value()) {
            Ok(state) => state,
            Err(_) => {
                self.fail_transition(self.state, AlError::UnknownStateRequest);
                return
            },
        };
        if requested == self.state
            {return}

        let backward = requested.rank() < self.state.rank()
            || (requested == AlState::Init && self.state == AlState::Bootstrap);
        if ! backward {
            if requested == AlState::Bootstrap {
                if self.state != AlState::Init
                    {return self.fail_transition(requested, AlError::InvalidStateRequest)}
                if ! self.bootstrap
                    {return self.fail_transition(requested, AlError::BootstrapNotSupported)}
            }
            else if self.state == AlState::Bootstrap || requested.rank() != self.state.rank() + 1 {
                return self.fail_transition(requested, AlError::InvalidStateRequest);
            }
            if requested == AlState::PreOperational && self.mailbox.is_some()
            && self.configured_mailbox() != self.mailbox {
                return self.fail_transition(requested, AlError::InvalidMailboxConfigPreop);
            }
            if requested == AlState::SafeOperational {
                let matches = |index, buffer: Buffer| buffer.size == 0 || self.channel(index)
                    .map(|channel| channel.address() == buffer.address && channel.length() == buffer.size)
                    .unwrap_or(false);
                let (outputs, inputs) = (matches(2, self.outputs), matches(3, self.inputs));
                if ! outputs
                    {return self.fail_transition(requested, AlError::InvalidOutputConfig)}
                if ! inputs
                    {return self.fail_transition(requested, AlError::InvalidInputConfig)}
            }
        }
        if requested == AlState::Init {
            self.responses.clear();
            self.segmented = None;
        }
        log::debug!("simulated slave {} {} -> {}", self.station(), self.state, requested);
        self.state = requested;
        self.transitions.push(requested);
        self.set_status(false);
        let _ = registers::al::error.set(&mut self.memory, AlError::NoError);
    }

    fn sii_operation(&mut self) {
        let Ok(mut control) = registers::sii::control.get(&self.memory)
            else {return};
        if ! control.read_operation()
            {return}
        let word = registers::sii::address.get(&self.memory).unwrap_or(0) as usize;
        let mut chunk = [0xff; 4];
        for (i, byte) in chunk.iter_mut().enumerate() {
            if let Some(value) = self.eeprom.get(word * sii::WORD + i) {
                *byte = *value;
            }
        }
        let _ = registers::sii::data.set(&mut self.memory, chunk);
        control.set_read_operation(false);
        control.set_busy(false);
        let _ = registers::sii::control.set(&mut self.memory, control);
    }

    fn mailbox_request(&mut self, write: Buffer) {
        if self.state == AlState::Init
            {return}
        let start = usize::from(write.address);
        let Ok(header) = MailboxHeader::unpack(&self.memory[start ..])
            else {return};
        let end = (start + MAILBOX_HEADER + usize::from(header.length))
            .min(start + usize::from(write.size));
        let payload = self.memory[start + MAILBOX_HEADER .. end].to_vec();
        if self.muted {
            log::trace!("simulated slave {} ignores mailbox request", self.station());
            return
        }
        if ! self.responses.is_empty() {
            self.overlaps += 1;
        }
        if header.ty != MailboxType::Can
            {return}
        self.served += 1;

        let capacity = self.configured_mailbox()
            .map(|(_, read)| usize::from(read.size).saturating_sub(MAILBOX_HEADER))
            .unwrap_or(0);
        let Some(answer) = self.serve_coe(&payload, capacity)
            else {return};
        let mut frame = vec![0; MAILBOX_HEADER + answer.len()];
        let header = MailboxHeader {
            length: answer.len() as u16,
            address: 0,
            priority: 0,
            ty: MailboxType::Can,
            count: header.count,
        };
        if header.pack(&mut frame).is_err()
            {return}
        frame[MAILBOX_HEADER ..].copy_from_slice(&answer);
        if self.holding {
            self.held.push(frame);
            return
        }
        if self.duplicating {
            self.respond(frame.clone());
        }
        self.respond(frame);
    }

    fn respond(&mut self, frame: Vec<u8>) {
        self.responses.push_back(frame);
        if self.responses.len() == 1 {
            self.load_response();
        }
    }

    /// copy the first pending response in the read buffer
    fn load_response(&mut self) {
        let (Some((_, read)), Some(frame)) = (self.configured_mailbox(), self.responses.front())
            else {return};
        let start = usize::from(read.address);
        let size = frame.len().min(usize::from(read.size));
        self.memory[start .. start + size].copy_from_slice(&frame[.. size]);
    }

    fn serve_coe(&mut self, payload: &[u8], capacity: usize) -> Option<Vec<u8>> {
        let mut cursor = Cursor::new(payload);
        let coe = cursor.unpack::<CoeHeader>().ok()?;
        if coe.can_service() != CanService::SdoRequest
            {return None}
        let first = *cursor.remain().first()?;
        let mut answer = vec![0; capacity];
        let mut out = Cursor::new(answer.as_mut_slice());
        out.pack(&CoeHeader::service_header(CanService::SdoResponse)).ok()?;

        let result = match first >> 5 {
            // initiate download
            1 => self.initiate_download(&mut cursor, &mut out),
            // download segment
            0 => self.download_segment(&mut cursor, &mut out),
            // initiate upload
            2 => self.initiate_upload(&mut cursor, &mut out),
            // upload segment
            3 => self.upload_segment(&mut cursor, &mut out),
            // abort
            4 => {
                self.segmented = None;
                return None
            },
            _ => Err((0, 0, SdoAbortCode::UnsupportedCommand)),
        };
        match result {
            Ok(()) => {
                let size = out.position();
                answer.truncate(size);
                Some(answer)
            },
            Err((index, sub, code)) => {
                self.segmented = None;
                let mut abort = vec![0; can::COE_HEADER + can::SDO_HEADER + 4];
                let mut out = Cursor::new(abort.as_mut_slice());
                out.pack(&CoeHeader::service_header(CanService::SdoRequest)).ok()?;
                out.pack(&SdoHeader::addressing(can::SdoCommandRequest::Abort as u8, index, sub)).ok()?;
                out.pack(&u32::from(code)).ok()?;
                Some(abort)
            },
        }
    }

    fn object(&self, index: u16, sub: u8) -> Result<&Object, SdoAbortCode> {
        self.objects.get(&(index, sub)).ok_or_else(||
            if self.objects.keys().any(|&(i, _)| i == index)
                {SdoAbortCode::InvalidSubIndex}
            else
                {SdoAbortCode::InvalidIndex})
    }

    fn store(&mut self, index: u16, sub: u8, data: Vec<u8>) -> Result<(), SdoAbortCode> {
        let object = self.objects.get_mut(&(index, sub)).ok_or(SdoAbortCode::InvalidIndex)?;
        if object.data.len() != data.len()
            {return Err(SdoAbortCode::InvalidLength)}
        object.data = data;
        Ok(())
    }

    fn initiate_download(&mut self, cursor: &mut Cursor<&[u8]>, out: &mut Cursor<&mut [u8]>) -> Result<(), (u16, u8, SdoAbortCode)> {
        let header = cursor.unpack::<SdoHeader>().map_err(|_| (0, 0, SdoAbortCode::GeneralError))?;
        let (index, sub) = (header.index(), header.sub());
        let abort = |code| (index, sub, code);
        let object = self.object(index, sub).map_err(abort)?;
        if ! object.writable
            {return Err(abort(SdoAbortCode::ReadOnly))}
        let expected = object.data.len();

        if header.expedited() {
            let size = if header.sized() {4 - usize::from(header.size().value())} else {expected.min(4)};
            let data = cursor.read(size).map_err(|_| abort(SdoAbortCode::InvalidLength))?.to_vec();
            self.store(index, sub, data).map_err(abort)?;
        }
        else {
            let total = cursor.unpack::<u32>().map_err(|_| abort(SdoAbortCode::InvalidLength))? as usize;
            if total != expected
                {return Err(abort(SdoAbortCode::InvalidLength))}
            let data = cursor.remain();
            let received = data[.. data.len().min(total)].to_vec();
            if received.len() >= total {
                self.store(index, sub, received).map_err(abort)?;
            }
            else {
                self.segmented = Some(Segmented::Download {index, sub, total, received, toggle: false});
            }
        }
        out.pack(&SdoHeader::addressing(SdoCommandResponse::Download as u8, index, sub)).map_err(|_| abort(SdoAbortCode::GeneralError))?;
        out.write(&[0; 4]).map_err(|_| abort(SdoAbortCode::GeneralError))?;
        Ok(())
    }

    fn download_segment(&mut self, cursor: &mut Cursor<&[u8]>, out: &mut Cursor<&mut [u8]>) -> Result<(), (u16, u8, SdoAbortCode)> {
        let Some(Segmented::Download {index, sub, total, mut received, toggle}) = self.segmented.take()
            else {return Err((0, 0, SdoAbortCode::UnsupportedCommand))};
        let abort = |code| (index, sub, code);
        let header = cursor.unpack::<SdoSegmentHeader>().map_err(|_| abort(SdoAbortCode::GeneralError))?;
        if header.toggle() != toggle
            {return Err(abort(SdoAbortCode::BadToggle))}
        let data = cursor.remain();
        let size = if data.len() == can::SEGMENT_MIN_DATA
            {can::SEGMENT_MIN_DATA - usize::from(header.size().value())}
            else {data.len()};
        let size = size.min(total - received.len());
        received.extend_from_slice(&data[.. size]);
        if header.last() || received.len() >= total {
            self.store(index, sub, received).map_err(abort)?;
        }
        else {
            self.segmented = Some(Segmented::Download {index, sub, total, received, toggle: ! toggle});
        }
        out.pack(&SdoSegmentHeader::segment(SdoCommandResponse::DownloadSegment as u8, toggle, false, can::SEGMENT_MIN_DATA))
            .map_err(|_| abort(SdoAbortCode::GeneralError))?;
        out.write(&[0; can::SEGMENT_MIN_DATA]).map_err(|_| abort(SdoAbortCode::GeneralError))?;
        Ok(())
    }

    fn initiate_upload(&mut self, cursor: &mut Cursor<&[u8]>, out: &mut Cursor<&mut [u8]>) -> Result<(), (u16, u8, SdoAbortCode)> {
        let header = cursor.unpack::<SdoHeader>().map_err(|_| (0, 0, SdoAbortCode::GeneralError))?;
        let (index, sub) = (header.index(), header.sub());
        let abort = |code| (index, sub, code);
        let data = self.object(index, sub).map_err(abort)?.data.clone();
        let failed = |_| abort(SdoAbortCode::GeneralError);

        let mut answer = SdoHeader::addressing(SdoCommandResponse::Upload as u8, index, sub);
        answer.set_sized(true);
        if data.len() <= can::EXPEDITED_MAX_SIZE {
            answer.set_expedited(true);
            answer.set_size(u2::new((can::EXPEDITED_MAX_SIZE - data.len()) as u8));
            out.pack(&answer).map_err(failed)?;
            out.write(&data).map_err(failed)?;
            out.write(&[0; can::EXPEDITED_MAX_SIZE][data.len() ..]).map_err(failed)?;
        }
        else {
            out.pack(&answer).map_err(failed)?;
            out.pack(&(data.len() as u32)).map_err(failed)?;
            let chunk = data.len().min(out.remaining());
            out.write(&data[.. chunk]).map_err(failed)?;
            if chunk < data.len() {
                self.segmented = Some(Segmented::Upload {data, sent: chunk, toggle: false});
            }
        }
        Ok(())
    }

    fn upload_segment(&mut self, cursor: &mut Cursor<&[u8]>, out: &mut Cursor<&mut [u8]>) -> Result<(), (u16, u8, SdoAbortCode)> {
        let Some(Segmented::Upload {data, sent, toggle}) = self.segmented.take()
            else {return Err((0, 0, SdoAbortCode::UnsupportedCommand))};
        let header = cursor.unpack::<SdoSegmentHeader>().map_err(|_| (0, 0, SdoAbortCode::GeneralError))?;
        if header.toggle() != toggle
            {return Err((0, 0, SdoAbortCode::BadToggle))}
        let failed = |_| (0, 0, SdoAbortCode::GeneralError);

        let chunk = (data.len() - sent).min(out.remaining() - can::SDO_SEGMENT_HEADER);
        let last = sent + chunk == data.len();
        out.pack(&SdoSegmentHeader::segment(SdoCommandResponse::UploadSegment as u8, toggle, last, chunk)).map_err(failed)?;
        out.write(&data[sent ..][.. chunk]).map_err(failed)?;
        if chunk < can::SEGMENT_MIN_DATA {
            out.write(&[0; can::SEGMENT_MIN_DATA][chunk ..]).map_err(failed)?;
        }
        if ! last {
            self.segmented = Some(Segmented::Upload {data, sent: sent + chunk, toggle: ! toggle});
        }
        Ok(())
    }

    /// logical memory access through the FMMUs, returns the working count increment
    fn logical(&mut self, command: PduCommand, address: u32, data: &mut [u8]) -> u16 {
        let pdu = u64::from(address) .. u64::from(address) + data.len() as u64;
        let incoming = data.to_vec();
        let (mut read, mut written) = (false, false);
        for index in 0 .. FMMU_ENTRIES {
            let Ok(entry) = registers::fmmu.entry(index).get(&self.memory)
                else {continue};
            if ! entry.enable()
                {continue}
            let mapped = u64::from(entry.logical_start_byte())
                .. u64::from(entry.logical_start_byte()) + u64::from(entry.logical_len_byte());
            if ! overlaps(&pdu, &mapped)
                {continue}
            let start = pdu.start.max(mapped.start);
            let end = pdu.end.min(mapped.end);
            let in_pdu = (start - pdu.start) as usize .. (end - pdu.start) as usize;
            let physical = usize::from(entry.physical_start_byte()) + (start - mapped.start) as usize;
            let physical = physical .. physical + in_pdu.len();
            if physical.end > self.memory.len()
                {continue}

            if entry.read() && self.state.exchanges_process_data()
            && matches!(command, PduCommand::LRD | PduCommand::LRW) {
                data[in_pdu.clone()].copy_from_slice(&self.memory[physical.clone()]);
                read = true;
            }
            if entry.write() && self.state == AlState::Operational
            && matches!(command, PduCommand::LWR | PduCommand::LRW) {
                self.memory[physical].copy_from_slice(&incoming[in_pdu]);
                written = true;
            }
        }
        u16::from(read) + if written {
            if command == PduCommand::LRW {2} else {1}
        } else {0}
    }
}

fn overlaps<T: PartialOrd>(a: &core::ops::Range<T>, b: &core::ops::Range<T>) -> bool {
    a.start < b.end && b.start < a.end
}

fn push_category(eeprom: &mut Vec<u8>, ty: CategoryType, data: &[u8]) -> PackingResult<()> {
    let words = (data.len() + 1) / sii::WORD;
    let mut header = CategoryHeader::from(0u32);
    header.set_category(u15::new(u16::from(ty)));
    header.set_size(words as u16);
    let mut packed = [0; 4];
    header.pack(&mut packed)?;
    eeprom.extend_from_slice(&packed);
    eeprom.extend_from_slice(data);
    eeprom.resize(eeprom.len() + words * sii::WORD - data.len(), 0);
    Ok(())
}


struct BusState {
    slaves: Vec<SimulatedSlave>,
    answers: VecDeque<Vec<u8>>,
    /// number of next frames to lose
    drop: usize,
    /// auto-incremented reads of the first register
    probes: usize,
}

impl BusState {
    fn process(&mut self, frame: &mut Frame) {
        for pdu in frame.pdus.iter_mut() {
            use PduCommand::*;
            let (read, write) = match pdu.command {
                APRD | FPRD | BRD | LRD => (true, false),
                APWR | FPWR | BWR | LWR => (false, true),
                APRW | FPRW | BRW | LRW => (true, true),
                NOP | ARMW | FRMW => continue,
            };
            if pdu.command == APRD && usize::from(pdu.memory_address) == registers::controller_type.byte {
                self.probes += 1;
            }
            for slave in self.slaves.iter_mut().filter(|slave| slave.connected) {
                match pdu.command {
                    APRD | APWR | APRW => {
                        if pdu.slave_address == 0 {
                            pdu.working_count += slave.physical(read, write, pdu.memory_address, &mut pdu.data, false);
                        }
                        pdu.slave_address = pdu.slave_address.wrapping_add(1);
                    },
                    FPRD | FPWR | FPRW => {
                        if pdu.slave_address == slave.station() {
                            pdu.working_count += slave.physical(read, write, pdu.memory_address, &mut pdu.data, false);
                        }
                    },
                    BRD | BWR | BRW => {
                        pdu.working_count += slave.physical(read, write, pdu.memory_address, &mut pdu.data, true);
                    },
                    _ => {
                        pdu.working_count += slave.logical(pdu.command, pdu.logical_address(), &mut pdu.data);
                    },
                }
            }
        }
    }
}

/**
    ethercat segment of [SimulatedSlave]s, processing frames synchronously when they are sent

    Clones share the same segment, so a test can keep one clone to inject faults and inspect the slaves while the master owns an other one as its socket. Slaves are designated by their position on the bus.
*/
#[derive(Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    pub fn new(slaves: Vec<SimulatedSlave>) -> Self {
        let mut slaves = slaves;
        for slave in slaves.iter_mut() {
            slave.power_on();
        }
        Self {state: Arc::new(Mutex::new(BusState {
            slaves,
            answers: VecDeque::new(),
            drop: 0,
            probes: 0,
        }))}
    }
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
    fn with_slave<R>(&self, position: usize, action: impl FnOnce(&mut SimulatedSlave) -> R) -> Option<R> {
        self.lock().slaves.get_mut(position).map(action)
    }

    /// the slave stops answering, as if its cable was pulled
    pub fn disconnect(&self, position: usize) {
        self.with_slave(position, |slave| slave.connected = false);
    }
    pub fn reconnect(&self, position: usize) {
        self.with_slave(position, |slave| slave.connected = true);
    }
    /// lose the next `frames` frames sent
    pub fn drop_frames(&self, frames: usize) {
        self.lock().drop = frames;
    }
    /// the slave ignores mailbox requests while muted
    pub fn mute_mailbox(&self, position: usize, muted: bool) {
        self.with_slave(position, |slave| slave.muted = muted);
    }
    /**
        while holding, the slave serves mailbox requests but keeps its answers

        Releasing puts the held answers in the read mailbox, as a slave answering late would.
    */
    pub fn hold_mailbox(&self, position: usize, holding: bool) {
        self.with_slave(position, |slave| {
            slave.holding = holding;
            if ! holding {
                for frame in core::mem::take(&mut slave.held) {
                    slave.respond(frame);
                }
            }
        });
    }
    /// the slave puts every mailbox answer twice in its read mailbox
    pub fn duplicate_answers(&self, position: usize, duplicating: bool) {
        self.with_slave(position, |slave| slave.duplicating = duplicating);
    }
    /// the slave ignores AL state requests while stuck
    pub fn stick_state(&self, position: usize, stuck: bool) {
        self.with_slave(position, |slave| slave.stuck = stuck);
    }
    /// the slave loses its FMMU setup, it keeps its state but no longer exchanges process data
    pub fn clear_fmmus(&self, position: usize) {
        self.with_slave(position, |slave| {
            let start = usize::from(registers::fmmu.address);
            let end = (start + 0x10 * usize::from(registers::fmmu.num)).min(slave.memory.len());
            slave.memory[start .. end].fill(0);
        });
    }

    pub fn state(&self, position: usize) -> Option<AlState> {
        self.with_slave(position, |slave| slave.state)
    }
    /// station address of the slave
    pub fn station(&self, position: usize) -> Option<u16> {
        self.with_slave(position, |slave| slave.station())
    }
    /// states reached by the slave, in order
    pub fn transitions(&self, position: usize) -> Vec<AlState> {
        self.with_slave(position, |slave| slave.transitions.clone()).unwrap_or_default()
    }
    /// number of auto-incremented reads of the controller type register received, as done by a bus scan
    pub fn probes(&self) -> usize {
        self.lock().probes
    }
    /// number of CoE requests received by the slave
    pub fn served(&self, position: usize) -> usize {
        self.with_slave(position, |slave| slave.served).unwrap_or(0)
    }
    /// number of mailbox requests received while an answer was still waiting to be read
    pub fn overlaps(&self, position: usize) -> usize {
        self.with_slave(position, |slave| slave.overlaps).unwrap_or(0)
    }
    /// current value of an object in the slave's dictionnary
    pub fn object(&self, position: usize, index: u16, sub: u8) -> Option<Vec<u8>> {
        self.with_slave(position, |slave| slave.objects.get(&(index, sub)).map(|object| object.data.clone()))
            .flatten()
    }
    /// set the process inputs of the slave
    pub fn set_inputs(&self, position: usize, data: &[u8]) {
        self.with_slave(position, |slave| {
            let start = usize::from(slave.inputs.address);
            let size = data.len().min(usize::from(slave.inputs.size));
            slave.memory[start ..][.. size].copy_from_slice(&data[.. size]);
        });
    }
    /// process outputs received by the slave
    pub fn outputs(&self, position: usize) -> Vec<u8> {
        self.with_slave(position, |slave| {
            let start = usize::from(slave.outputs.address);
            slave.memory[start ..][.. usize::from(slave.outputs.size)].to_vec()
        }).unwrap_or_default()
    }
}

impl EthercatSocket for SimulatedBus {
    fn receive(&self, data: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        let answer = self.lock().answers.pop_front().ok_or_else(timed_out)?;
        let size = answer.len().min(data.len());
        data[.. size].copy_from_slice(&answer[.. size]);
        Ok(size)
    }
    fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut frame = Frame::decode(data)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        let mut state = self.lock();
        if state.drop != 0 {
            state.drop -= 1;
            return Ok(())
        }
        state.process(&mut frame);
        let answer = frame.encode()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        state.answers.push_back(answer);
        Ok(())
    }
    fn max_frame(&self) -> usize {
        ETHERCAT_HEADER + MAX_FRAME_BODY
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frame::Pdu,
        registers::{SyncDirection, SyncMode},
        };

    fn exchange(bus: &SimulatedBus, pdus: Vec<Pdu>) -> Frame {
        bus.send(&Frame::with(pdus).encode().unwrap()).unwrap();
        let mut buffer = [0; 1600];
        let size = bus.receive(&mut buffer, Duration::ZERO).unwrap();
        Frame::decode(&buffer[.. size]).unwrap()
    }

    #[test]
    fn auto_increment() {
        let bus = SimulatedBus::new(vec![SimulatedSlave::new(1, 1), SimulatedSlave::new(1, 2)]);
        let answer = exchange(&bus, vec![
            Pdu::new(PduCommand::APRD, 0, 0, vec![0]),
            Pdu::new(PduCommand::APRD, 0u16.wrapping_sub(1), 0, vec![0]),
            Pdu::new(PduCommand::APRD, 0u16.wrapping_sub(2), 0, vec![0]),
            ]);
        let counts: Vec<u16> = answer.pdus.iter().map(|pdu| pdu.working_count).collect();
        assert_eq!(counts, [1, 1, 0]);
        assert_eq!(answer.pdus[0].data, [CONTROLLER_TYPE]);
        assert_eq!(bus.probes(), 3);
    }

    #[test]
    fn refuses_skipped_states() {
        let bus = SimulatedBus::new(vec![SimulatedSlave::new(1, 1)]);
        let answer = exchange(&bus, vec![
            Pdu::new(PduCommand::BWR, 0, 0x120, vec![AlState::SafeOperational as u8]),
            Pdu::new(PduCommand::BRD, 0, 0x130, vec![0, 0, 0, 0, 0, 0]),
            ]);
        // error flag and code
        assert_eq!(answer.pdus[1].data[0], 0x11);
        assert_eq!(&answer.pdus[1].data[4..6], &[0x11, 0]);
        assert_eq!(bus.state(0), Some(AlState::Init));

        // mailbox not configured
        exchange(&bus, vec![Pdu::new(PduCommand::BWR, 0, 0x120, vec![0x10 | AlState::PreOperational as u8])]);
        assert_eq!(bus.state(0), Some(AlState::Init));

        let mut channel = [0; 8];
        SyncManagerChannel::configured(MAILBOX_WRITE, MAILBOX_SIZE, SyncMode::Mailbox, SyncDirection::Write).pack(&mut channel).unwrap();
        let mut channels = channel.to_vec();
        SyncManagerChannel::configured(MAILBOX_READ, MAILBOX_SIZE, SyncMode::Mailbox, SyncDirection::Read).pack(&mut channel).unwrap();
        channels.extend_from_slice(&channel);
        exchange(&bus, vec![
            Pdu::new(PduCommand::BWR, 0, 0x800, channels),
            Pdu::new(PduCommand::BWR, 0, 0x120, vec![0x10 | AlState::PreOperational as u8]),
            ]);
        assert_eq!(bus.state(0), Some(AlState::PreOperational));
        assert_eq!(bus.transitions(0), [AlState::PreOperational]);
    }

    #[test]
    fn eeprom_content() {
        let slave = SimulatedSlave::new(0x2, 0x1234).with_name("EL1008").with_process_data(0, 1);
        let eeprom = slave.build_eeprom().unwrap();
        assert_eq!(eeprom::device::product.get(&eeprom).unwrap(), 0x1234);
        assert_eq!(eeprom::mailbox::receive_offset.get(&eeprom).unwrap(), MAILBOX_WRITE);
        // strings category follows the fixed registers
        assert_eq!(&eeprom[eeprom::categories ..][.. 2], &[10, 0]);
        assert_eq!(&eeprom[eeprom.len() - 4 ..], &[0xff; 4]);
    }
}

/*!
	Frame exchange with the segment.

	[RawMaster] owns the socket. Every call sends one frame and blocks until the same frame comes back from the end of the ring, or the response timeout expires.
*/

use std::time::Instant;
use core::time::Duration;

use crate::{
    socket::EthercatSocket,
    frame::{Frame, Pdu, PduCommand, ETHERCAT_HEADER, MAX_FRAME_BODY},
    data::{Field, PduData, Storage},
    error::{EthercatError, EthercatResult},
    };


/// receive buffer size, big enough for any ethernet frame
const MAX_ETHERCAT_FRAME: usize = 2050;

/**
    single owner of the bus, executing PDUs with no knowledge of the slaves behind the addresses

    Two memories are reachable through PDUs:

    - the registers of each slave, addressed by position (`AP*`), by station (`FP*`) or all together (`B*`), their layout is in [crate::registers]
    - the logical memory, addressed by `L*` commands, that the FMMUs of the slaves map onto their registers once [crate::mapping] configured them

    The medium behind the socket is abstracted by [crate::socket]. Frames are never pipelined: one frame is in flight at a time, its token is checked on return, and frames with no answer count as lost until the next answered one.
*/
pub struct RawMaster {
	socket: Box<dyn EthercatSocket + Send + Sync>,
	/// time to wait for the echo of a frame
	response_timeout: Duration,
	/// next PDU token
	token: u8,
	/// number of frames lost in a row
	lost: usize,
	receive: Box<[u8; MAX_ETHERCAT_FRAME]>,
}

impl RawMaster {
	pub fn new<S: EthercatSocket + 'static + Send + Sync>(socket: S, response_timeout: Duration) -> Self {
        Self {
            socket: Box::new(socket),
            response_timeout,
            token: 0,
            lost: 0,
            receive: Box::new([0; MAX_ETHERCAT_FRAME]),
        }
	}
	pub fn response_timeout(&self) -> Duration  {self.response_timeout}
	/// number of consecutive frames that got no answer, reset by any answered frame
	pub fn lost_frames(&self) -> usize  {self.lost}
	/// maximum body size of a frame accepted by the socket
	pub fn frame_capacity(&self) -> usize {
        self.socket.max_frame()
            .saturating_sub(ETHERCAT_HEADER)
            .min(MAX_FRAME_BODY)
	}

	/**
        send the given frame and wait for its echo, the PDUs data and working counts are then replaced by the answered ones

        Frames received that cannot be decoded or that do not match the sent frame are discarded. If no matching answer comes before the response timeout, [EthercatError::Timeout] is returned and the frame is considered lost.
	*/
	pub fn transact(&mut self, frame: &mut Frame) -> EthercatResult {
        for pdu in frame.pdus.iter_mut() {
            pdu.token = self.token;
            self.token = self.token.wrapping_add(1);
        }
        let raw = frame.encode()?;
        self.socket.send(&raw)?;

        let deadline = Instant::now() + self.response_timeout;
        loop {
            let remain = deadline.saturating_duration_since(Instant::now());
            let size = match self.socket.receive(self.receive.as_mut_slice(), remain) {
                Ok(size) => size,
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                    self.lost += 1;
                    log::debug!("frame lost ({} in a row)", self.lost);
                    return Err(EthercatError::Timeout("no answer to frame"));
                },
                Err(err) => return Err(err.into()),
            };
            let answer = match Frame::decode(&self.receive[.. size]) {
                Ok(answer) => answer,
                Err(err) => {
                    log::warn!("discarding received frame: {}", err);
                    continue
                },
            };
            if ! Self::matches(frame, &answer) {
                log::debug!("discarding unmatched frame");
                continue
            }
            for (sent, received) in frame.pdus.iter_mut().zip(answer.pdus) {
                sent.data = received.data;
                sent.working_count = received.working_count;
            }
            self.lost = 0;
            return Ok(())
        }
	}

	fn matches(sent: &Frame, received: &Frame) -> bool {
        sent.pdus.len() == received.pdus.len()
        && sent.pdus.iter().zip(received.pdus.iter()).all(|(s, r)|
            s.token == r.token
            && s.command == r.command
            && s.data.len() == r.data.len()
            )
	}

	/// execute one PDU alone in a frame, `data` receives what came back, returns the working counter
	pub fn pdu(&mut self, command: PduCommand, slave_address: u16, memory_address: u16, data: &mut [u8]) -> EthercatResult<u16> {
        let mut frame = Frame::with(vec![Pdu::new(command, slave_address, memory_address, data.to_vec())]);
        self.transact(&mut frame)?;
        let pdu = &frame.pdus[0];
        data.copy_from_slice(&pdu.data);
        Ok(pdu.working_count)
	}

	pub fn brd<T: PduData>(&mut self, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read(SlaveAddress::Broadcast, address)
	}
	pub fn bwr<T: PduData>(&mut self, address: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        self.write(SlaveAddress::Broadcast, address, data)
	}
	pub fn aprd<T: PduData>(&mut self, slave: u16, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read(SlaveAddress::AutoIncremented(slave), address)
	}
	pub fn apwr<T: PduData>(&mut self, slave: u16, address: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        self.write(SlaveAddress::AutoIncremented(slave), address, data)
	}
	pub fn fprd<T: PduData>(&mut self, slave: u16, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read(SlaveAddress::Fixed(slave), address)
	}
	pub fn fpwr<T: PduData>(&mut self, slave: u16, address: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        self.write(SlaveAddress::Fixed(slave), address, data)
	}

	/// read a register or logical field, with the read command matching `slave`
	pub fn read<T: PduData>(&mut self, slave: SlaveAddress, memory: Field<T>) -> EthercatResult<PduAnswer<T>> {
        let (command, slave, memory) = slave.command(Access::Read, memory.byte);
        let mut buffer = T::Packed::zeroed();
        let answers = self.pdu(command, slave, memory, &mut buffer.as_mut()[.. T::Packed::LEN])?;
        Ok(PduAnswer {
			answers,
			value: T::unpack(buffer.as_ref())?,
			})
    }
	/// write a register or logical field
	pub fn write<T: PduData>(&mut self, slave: SlaveAddress, memory: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        let (command, slave, memory) = slave.command(Access::Write, memory.byte);
        let mut buffer = T::Packed::zeroed();
        data.pack(buffer.as_mut())?;
		Ok(PduAnswer {
			answers: self.pdu(command, slave, memory, buffer.as_mut())?,
			value: (),
			})
	}
	/// write a field and get its previous content in the same PDU
	pub fn exchange<T: PduData>(&mut self, slave: SlaveAddress, memory: Field<T>, data: T) -> EthercatResult<PduAnswer<T>> {
        let (command, slave, memory) = slave.command(Access::Exchange, memory.byte);
        let mut buffer = T::Packed::zeroed();
        data.pack(buffer.as_mut())?;
        let answers = self.pdu(command, slave, memory, buffer.as_mut())?;
        Ok(PduAnswer {
			answers,
			value: T::unpack(buffer.as_ref())?,
			})
	}
}

#[derive(Copy, Clone)]
enum Access {Read, Write, Exchange}

/// destination of a PDU, it selects the command family
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlaveAddress {
	/// all slaves, the working counter counts them
	Broadcast,
	/// position in the ring starting from 0, valid before stations are assigned
	AutoIncremented(u16),
	/// station address configured during the scan
	Fixed(u16),
	/// the logical memory is the destination, all slaves are concerned. The field byte is the 32 bits logical address
	Logical,
}
impl SlaveAddress {
    /// command and address fields of a PDU accessing `memory` on this destination
    fn command(self, access: Access, memory: usize) -> (PduCommand, u16, u16) {
        use PduCommand::*;
        let pick = |read, write, exchange| match access {
            Access::Read => read,
            Access::Write => write,
            Access::Exchange => exchange,
            };
        match self {
            SlaveAddress::Broadcast => (pick(BRD, BWR, BRW), 0, memory as u16),
            SlaveAddress::AutoIncremented(position) => (pick(APRD, APWR, APRW), 0u16.wrapping_sub(position), memory as u16),
            SlaveAddress::Fixed(station) => (pick(FPRD, FPWR, FPRW), station, memory as u16),
            SlaveAddress::Logical => (pick(LRD, LWR, LRW), memory as u16, (memory >> 16) as u16),
        }
    }
}

/// value returned by a PDU with its working counter
#[derive(Clone, Debug)]
pub struct PduAnswer<T> {
	pub value: T,
	/// working counter of the PDU
	pub answers: u16,
}
impl<T> PduAnswer<T> {
    /// extract the value if exactly one slave answered
    pub fn one(self) -> EthercatResult<T>  {self.exact(1)}
    /// extract the value if exactly `n` slaves answered
    pub fn exact(self, n: u16) -> EthercatResult<T> {
        if self.answers != n {
            return Err(EthercatError::WorkingCounter {expected: n, answered: self.answers});
        }
        Ok(self.value)
    }
}

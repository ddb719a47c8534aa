use core::time::Duration;
use std::{
    ffi::CString,
    io,
    mem,
    os::unix::io::{AsRawFd, RawFd},
    time::Instant,
    };
use packed_struct::prelude::*;
use super::{EthercatSocket, ETHERCAT_ETHERTYPE, timed_out};

/// biggest ethernet frame handled, the FCS is added by the NIC
const MAX_ETHERNET_FRAME: usize = 1514;
/// shorter frames are padded with zeros
const MIN_ETHERNET_FRAME: usize = 60;
const ETHERNET_HEADER: usize = 14;
/// locally administered unicast address, slaves do not check it
const MASTER_MAC: [u8; 6] = [0x12, 0x10, 0x10, 0x10, 0x10, 0x10];

type EthernetFrame = heapless::Vec<u8, MAX_ETHERNET_FRAME>;

/**
    raw `AF_PACKET` socket on one network interface, filtered on the ethercat ethertype

    The interface must be dedicated to the segment: every frame is broadcast and the answers are recognized by their ethertype only. It needs `CAP_NET_RAW`. Linux only.
*/
#[derive(Debug)]
pub struct EthernetSocket {
    fd: RawFd,
    interface: String,
}

impl EthernetSocket {
    /// open a socket on the given interface, like `eth0`
    pub fn new(interface: &str) -> io::Result<Self> {
        let name = CString::new(interface)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name contains a nul byte"))?;
        let index = unsafe {libc::if_nametoindex(name.as_ptr())};
        if index == 0
            {return Err(io::Error::last_os_error())}

        let protocol = ETHERCAT_ETHERTYPE.to_be();
        let fd = cvt(unsafe {libc::socket(libc::AF_PACKET, libc::SOCK_RAW, libc::c_int::from(protocol))})?;
        // closed on error by drop
        let socket = Self {fd, interface: interface.to_owned()};

        let mut address: libc::sockaddr_ll = unsafe {mem::zeroed()};
        address.sll_family = libc::AF_PACKET as libc::c_ushort;
        address.sll_protocol = protocol;
        address.sll_ifindex = index as libc::c_int;
        cvt(unsafe {libc::bind(
            socket.fd,
            (&address as *const libc::sockaddr_ll).cast(),
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )})?;
        log::info!("raw ethercat socket bound to {} (index {})", interface, index);
        Ok(socket)
    }

    pub fn interface(&self) -> &str  {&self.interface}

    fn poll(&self, timeout: Duration) -> io::Result<()> {
        let mut pending = libc::pollfd {fd: self.fd, events: libc::POLLIN, revents: 0};
        let limit = timespec(timeout);
        match cvt(unsafe {libc::ppoll(&mut pending, 1, &limit, core::ptr::null())})? {
            0 => Err(timed_out()),
            _ => Ok(()),
        }
    }

    /// receive one ethernet frame and tell whether it was sent by this host
    fn receive_frame(&self, buffer: &mut [u8]) -> io::Result<(usize, bool)> {
        let mut source: libc::sockaddr_ll = unsafe {mem::zeroed()};
        let mut source_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
        let size = cvt(unsafe {libc::recvfrom(
            self.fd,
            buffer.as_mut_ptr().cast(),
            buffer.len(),
            0,
            (&mut source as *mut libc::sockaddr_ll).cast(),
            &mut source_len,
            )})?;
        Ok((size as usize, source.sll_pkttype == libc::PACKET_OUTGOING as u8))
    }
}

impl Drop for EthernetSocket {
    fn drop(&mut self) {
        unsafe {libc::close(self.fd);}
    }
}

impl AsRawFd for EthernetSocket {
    fn as_raw_fd(&self) -> RawFd  {self.fd}
}

impl EthercatSocket for EthernetSocket {
    fn receive(&self, data: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut buffer = [0u8; MAX_ETHERNET_FRAME];
        loop {
            self.poll(deadline.saturating_duration_since(Instant::now()))?;
            let (size, own) = self.receive_frame(&mut buffer)?;
            // the kernel also delivers the frames we send
            if own || size < ETHERNET_HEADER
                {continue}
            let Ok(header) = EthernetHeader::unpack_from_slice(&buffer[.. ETHERNET_HEADER])
                else {continue};
            if header.ethertype != ETHERCAT_ETHERTYPE
                {continue}

            let payload = &buffer[ETHERNET_HEADER .. size];
            let size = payload.len().min(data.len());
            data[.. size].copy_from_slice(&payload[.. size]);
            return Ok(size);
        }
    }

    fn send(&self, data: &[u8]) -> io::Result<()> {
        let frame = ethernet_frame(data)?;
        let sent = cvt(unsafe {libc::write(self.fd, frame.as_ptr().cast(), frame.len())})?;
        if sent as usize != frame.len()
            {return Err(io::Error::new(io::ErrorKind::WriteZero, "ethernet frame partially sent"))}
        Ok(())
    }

    fn max_frame(&self) -> usize {
        MAX_ETHERNET_FRAME - ETHERNET_HEADER
    }
}

/// broadcast ethernet frame carrying the given ethercat frame, without VLAN tag
fn ethernet_frame(ethercat: &[u8]) -> io::Result<EthernetFrame> {
    let too_big = |_| io::Error::new(io::ErrorKind::InvalidInput, "ethercat frame exceeds an ethernet frame");
    let header = EthernetHeader {
        destination: [0xff; 6],
        source: MASTER_MAC,
        ethertype: ETHERCAT_ETHERTYPE,
        }.pack()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "cannot pack ethernet header"))?;
    let mut frame = EthernetFrame::new();
    frame.extend_from_slice(&header).map_err(too_big)?;
    frame.extend_from_slice(ethercat).map_err(too_big)?;
    if frame.len() < MIN_ETHERNET_FRAME {
        frame.resize(MIN_ETHERNET_FRAME, 0).map_err(too_big)?;
    }
    Ok(frame)
}

/// poll limit with the full precision of `timeout`, cycles are often shorter than a millisecond
fn timespec(timeout: Duration) -> libc::timespec {
    let mut limit: libc::timespec = unsafe {mem::zeroed()};
    limit.tv_sec = libc::time_t::try_from(timeout.as_secs()).unwrap_or(libc::time_t::MAX);
    limit.tv_nsec = timeout.subsec_nanos() as _;
    limit
}

/// turn the `-1` convention of libc calls into an io error
fn cvt<T: Default + PartialOrd>(result: T) -> io::Result<T> {
    if result < T::default()
        {Err(io::Error::last_os_error())}
    else
        {Ok(result)}
}

#[derive(PackedStruct, Clone, Debug)]
#[packed_struct(size_bytes="14", bit_numbering="msb0", endian="msb")]
struct EthernetHeader {
    #[packed_field(bytes="0:5")]  destination: [u8; 6],
    #[packed_field(bytes="6:11")]  source: [u8; 6],
    #[packed_field(bytes="12:13")]  ethertype: u16,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing() {
        let frame = ethernet_frame(&[0x0c, 0x10, 1, 2]).unwrap();
        assert_eq!(frame.len(), MIN_ETHERNET_FRAME);
        assert_eq!(frame[.. 6], [0xff; 6]);
        assert_eq!(frame[6 .. 12], MASTER_MAC);
        assert_eq!(frame[12 .. 14], [0x88, 0xa4]);
        assert_eq!(frame[14 .. 18], [0x0c, 0x10, 1, 2]);

        let header = EthernetHeader::unpack_from_slice(&frame[.. ETHERNET_HEADER]).unwrap();
        assert_eq!(header.ethertype, ETHERCAT_ETHERTYPE);
        assert!(ethernet_frame(&[0; MAX_ETHERNET_FRAME]).is_err());
    }

    #[test]
    fn submillisecond_timeout() {
        let limit = timespec(Duration::from_micros(500));
        assert_eq!(limit.tv_sec, 0);
        assert_eq!(limit.tv_nsec, 500_000);
        let limit = timespec(Duration::from_micros(2_300));
        assert_eq!(limit.tv_sec, 0);
        assert_eq!(limit.tv_nsec, 2_300_000);
        let limit = timespec(Duration::from_secs(3));
        assert_eq!((limit.tv_sec, limit.tv_nsec), (3, 0));
    }
}

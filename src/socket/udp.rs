use core::time::Duration;
use std::io;
use std::net::{SocketAddr, IpAddr, Ipv4Addr};
use super::{EthercatSocket, ETHERCAT_ETHERTYPE, timed_out};

/// ethernet payload available for the ethercat frame, UDP frames are not fragmented
const MAX_UDP_FRAME: usize = 1472;

/// ethercat frames in UDP datagrams, exchanged with the address of the segment's first slave
pub struct UdpSocket {
    socket: std::net::UdpSocket,
    address: SocketAddr,

    filter_address: bool,
}

impl UdpSocket {
    /// bind the ethercat port on every local interface, frames go to `segment`
    pub fn new(segment: Ipv4Addr) -> io::Result<Self> {
        Self::bind(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), ETHERCAT_ETHERTYPE),
            SocketAddr::new(IpAddr::V4(segment), ETHERCAT_ETHERTYPE),
            )
    }
    /// bind the given local address, frames go to `segment`
    pub fn bind(local: SocketAddr, segment: SocketAddr) -> io::Result<Self> {
        let socket = std::net::UdpSocket::bind(local)?;
        log::info!("udp ethercat socket bound to {}, segment at {}", socket.local_addr()?, segment);
        Ok(Self {
            address: segment,
            socket,
            filter_address: true,
        })
    }
    /// when enabled (default) only the datagrams coming from the segment address are accepted
    pub fn set_filter_address(&mut self, enable: bool) {
        self.filter_address = enable;
    }
}

impl EthercatSocket for UdpSocket {
    fn receive(&self, data: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remain = deadline.saturating_duration_since(std::time::Instant::now());
            if remain.is_zero()
                {return Err(timed_out())}
            self.socket.set_read_timeout(Some(remain))?;
            let (size, source) = match self.socket.recv_from(data) {
                Ok(received) => received,
                Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
                    => return Err(timed_out()),
                Err(err) => return Err(err),
                };
            if self.filter_address && source != self.address
                {continue}
            return Ok(size);
        }
    }
    fn send(&self, data: &[u8]) -> io::Result<()> {
        self.socket.send_to(data, self.address)?;
        Ok(())
    }
    fn max_frame(&self) -> usize {
        MAX_UDP_FRAME
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket as Peer;

    #[test]
    fn filter_address() {
        let segment = Peer::bind("127.0.0.1:0").unwrap();
        let stranger = Peer::bind("127.0.0.1:0").unwrap();
        let mut socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), segment.local_addr().unwrap()).unwrap();
        let local = socket.socket.local_addr().unwrap();
        let mut data = [0; 16];

        socket.send(&[0x0c, 0x10]).unwrap();
        let (size, _) = segment.recv_from(&mut data).unwrap();
        assert_eq!(data[.. size], [0x0c, 0x10]);

        // datagrams from elsewhere are skipped
        stranger.send_to(&[1], local).unwrap();
        segment.send_to(&[2, 2], local).unwrap();
        assert_eq!(socket.receive(&mut data, Duration::from_secs(1)).unwrap(), 2);
        assert_eq!(data[.. 2], [2, 2]);

        socket.set_filter_address(false);
        stranger.send_to(&[3, 3, 3], local).unwrap();
        assert_eq!(socket.receive(&mut data, Duration::from_secs(1)).unwrap(), 3);
        assert_eq!(data[.. 3], [3; 3]);
        assert_eq!(socket.receive(&mut data, Duration::from_millis(10)).unwrap_err().kind(), io::ErrorKind::TimedOut);
    }
}

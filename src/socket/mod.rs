/*!
    Media carrying ethercat frames.

    Every medium implements [EthercatSocket], the rest of the stack only sees whole ethercat frames.

    - [EthernetSocket] puts frames directly in ethernet frames with the ethercat ethertype. The segment must be wired to a dedicated port and only one master can run on it, with no jitter added by other traffic.
    - [UdpSocket] puts frames in UDP datagrams on port `0x88a4`. Several masters can share a switched network, at the price of the delays the switch introduces.
    - [SimulatedBus] runs slaves inside the process, for tests and for applications developed without hardware.
*/

mod udp;
#[cfg(target_os = "linux")]
mod ethernet;
mod simulated;

pub use udp::UdpSocket;
#[cfg(target_os = "linux")]
pub use ethernet::EthernetSocket;
pub use simulated::{SimulatedBus, SimulatedSlave};

use core::time::Duration;
use std::io;

/// ethernet type of ethercat frames, also used as UDP port
pub const ETHERCAT_ETHERTYPE: u16 = 0x88a4;

/// medium able to carry ethercat frames
pub trait EthercatSocket {
    /**
        wait for the next ethercat frame and copy it in `data`, starting at the ethercat header

        Medium-specific headers are stripped. Returns the size of the frame, truncated to `data`. Fails with [io::ErrorKind::TimedOut] when nothing arrived within `timeout`.
    */
    fn receive(&self, data: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// send one complete ethercat frame, `data` starts with the ethercat header and has the exact frame size
    fn send(&self, data: &[u8]) -> io::Result<()>;

    /// biggest ethercat frame this medium can send
    fn max_frame(&self) -> usize;
}

pub(crate) fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "no ethercat frame received")
}

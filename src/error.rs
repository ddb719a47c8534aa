//! error type shared by every layer of the master

use std::sync::Arc;
use core::fmt;
use crate::can::SdoAbortCode;

/**
    failure of an operation on the bus

    The first variants are broad categories, the following ones are the precise failures of the master components, from the wire (frames) to the control loop (cycles). [Self::is_contained] tells whether the rest of the bus is affected.

    `T` is the code a slave can report for the operation, like [crate::registers::AlError] for state transitions. Operations where slaves report nothing use `()`.
*/
#[derive(Clone, Debug)]
pub enum EthercatError<T=()> {
    /// the transport failed, nothing can go through until it is fixed
    Io(Arc<std::io::Error>),

    /// code reported by the slave itself
    Slave(T),

    /// the master refused the operation: wrong argument, wrong state, or a resource gone
    Master(&'static str),

    /// the slave answered something this master does not understand
    Protocol(&'static str),

    /// no answer in time, the operation can be retried
    Timeout(&'static str),

    /// a received frame is truncated or its headers are inconsistent. Only the offending frame is lost.
    MalformedFrame(&'static str),
    /// the datagrams of a frame do not sum to the frame body length declared in its header
    LengthMismatch {
        /// body length declared in the ethercat header
        declared: usize,
        /// body length implied by the datagram headers
        actual: usize,
    },
    /// a single datagram was not processed by the expected number of slaves
    WorkingCounter {
        expected: u16,
        answered: u16,
    },

    /// the bus scan could not complete at the given position, after all retries
    TopologyScanFailed {
        position: u16,
    },
    /// a slave did not confirm a requested state or stopped answering
    Unresponsive {
        /// station address
        slave: u16,
    },
    /// the process data mapped for a slave does not match the sizes it declares
    PdoMappingMismatch {
        /// station address
        slave: u16,
        /// byte sizes (outputs, inputs) declared by the slave
        declared: (u16, u16),
        /// byte sizes (outputs, inputs) mapped in the process image
        mapped: (u16, u16),
    },

    /// the slave aborted an SDO transfer
    SdoAborted(SdoAbortCode),
    /// the slave never answered an SDO request, after all retries
    SdoTimeout,

    /// the process data frames were not processed by every active slave, the process image kept its previous content
    PartialCycleFailure {
        expected: u16,
        answered: u16,
    },
}

pub type EthercatResult<T=(), E=()> = core::result::Result<T, EthercatError<E>>;

impl<T: fmt::Debug> fmt::Display for EthercatError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(value) => write!(f, "io: {}", value),
            Self::Slave(value) => write!(f, "slave: {:?}", value),
            Self::Master(value) => write!(f, "master: {}", value),
            Self::Protocol(value) => write!(f, "protocol: {}", value),
            Self::Timeout(value) => write!(f, "timeout: {}", value),
            Self::MalformedFrame(value) => write!(f, "malformed frame: {}", value),
            Self::LengthMismatch {declared, actual} => write!(f,
                "frame length mismatch: header declares {} bytes, datagrams use {}",
                declared, actual),
            Self::WorkingCounter {expected, answered} => write!(f,
                "working counter mismatch: expected {}, got {}",
                expected, answered),
            Self::TopologyScanFailed {position} => write!(f,
                "topology scan failed at position {}", position),
            Self::Unresponsive {slave} => write!(f, "slave {} is unresponsive", slave),
            Self::PdoMappingMismatch {slave, declared, mapped} => write!(f,
                "slave {} declares {:?} bytes of (outputs, inputs) but {:?} are mapped",
                slave, declared, mapped),
            Self::SdoAborted(code) => write!(f, "sdo aborted: {:?} ({:#010x})", code, u32::from(*code)),
            Self::SdoTimeout => write!(f, "sdo timeout"),
            Self::PartialCycleFailure {expected, answered} => write!(f,
                "partial cycle failure: working counter {} instead of {}",
                answered, expected),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for EthercatError<T> {}

impl<T> From<std::io::Error> for EthercatError<T> {
    fn from(src: std::io::Error) -> Self {
        EthercatError::Io(Arc::new(src))
    }
}

impl<T> From<crate::data::PackingError> for EthercatError<T> {
    fn from(src: crate::data::PackingError) -> Self {
        EthercatError::Protocol(match src {
            crate::data::PackingError::BadSize(_, text) => text,
            crate::data::PackingError::BadAlignment(_, text) => text,
            crate::data::PackingError::InvalidValue(text) => text,
        })
    }
}

// `From<EthercatError<E>> for EthercatError<F>` would overlap `From<T> for T`
impl<E> EthercatError<E> {
    /// convert the slave code with `callback`, other variants are kept
    pub fn map<F,T>(self, callback: F) -> EthercatError<T>
    where F: FnOnce(E) -> T
    {
        match self {
            EthercatError::Slave(value) => EthercatError::Slave(callback(value)),
            EthercatError::Io(e) => EthercatError::Io(e),
            EthercatError::Master(message) => EthercatError::Master(message),
            EthercatError::Protocol(message) => EthercatError::Protocol(message),
            EthercatError::Timeout(message) => EthercatError::Timeout(message),
            EthercatError::MalformedFrame(message) => EthercatError::MalformedFrame(message),
            EthercatError::LengthMismatch {declared, actual} => EthercatError::LengthMismatch {declared, actual},
            EthercatError::WorkingCounter {expected, answered} => EthercatError::WorkingCounter {expected, answered},
            EthercatError::TopologyScanFailed {position} => EthercatError::TopologyScanFailed {position},
            EthercatError::Unresponsive {slave} => EthercatError::Unresponsive {slave},
            EthercatError::PdoMappingMismatch {slave, declared, mapped} => EthercatError::PdoMappingMismatch {slave, declared, mapped},
            EthercatError::SdoAborted(code) => EthercatError::SdoAborted(code),
            EthercatError::SdoTimeout => EthercatError::SdoTimeout,
            EthercatError::PartialCycleFailure {expected, answered} => EthercatError::PartialCycleFailure {expected, answered},
        }
    }
    /// drop the slave-specific error, replacing it by a generic slave report
    pub fn downgrade(self) -> EthercatError<()> {
        self.map(|_| ())
    }
    /// true if the error is contained to one slave or one transaction, and the bus can go on
    pub fn is_contained(&self) -> bool {
        matches!(self,
            EthercatError::Slave(_)
            | EthercatError::Unresponsive {..}
            | EthercatError::PdoMappingMismatch {..}
            | EthercatError::SdoAborted(_)
            | EthercatError::SdoTimeout
            | EthercatError::PartialCycleFailure {..}
            | EthercatError::WorkingCounter {..}
            | EthercatError::MalformedFrame(_)
            | EthercatError::LengthMismatch {..}
            )
    }
}
impl EthercatError<()> {
    /// convert an error with no slave-specific type into an error with any slave-specific type
    ///
    /// a generic slave report becomes a [Self::Protocol] error since there is no value to convert
    pub fn upgrade<F>(self) -> EthercatError<F> {
        match self {
            EthercatError::Slave(()) => EthercatError::Protocol("slave reported an error"),
            EthercatError::Io(e) => EthercatError::Io(e),
            EthercatError::Master(message) => EthercatError::Master(message),
            EthercatError::Protocol(message) => EthercatError::Protocol(message),
            EthercatError::Timeout(message) => EthercatError::Timeout(message),
            EthercatError::MalformedFrame(message) => EthercatError::MalformedFrame(message),
            EthercatError::LengthMismatch {declared, actual} => EthercatError::LengthMismatch {declared, actual},
            EthercatError::WorkingCounter {expected, answered} => EthercatError::WorkingCounter {expected, answered},
            EthercatError::TopologyScanFailed {position} => EthercatError::TopologyScanFailed {position},
            EthercatError::Unresponsive {slave} => EthercatError::Unresponsive {slave},
            EthercatError::PdoMappingMismatch {slave, declared, mapped} => EthercatError::PdoMappingMismatch {slave, declared, mapped},
            EthercatError::SdoAborted(code) => EthercatError::SdoAborted(code),
            EthercatError::SdoTimeout => EthercatError::SdoTimeout,
            EthercatError::PartialCycleFailure {expected, answered} => EthercatError::PartialCycleFailure {expected, answered},
        }
    }
}

impl From<EthercatError<()>> for EthercatError<crate::registers::AlError> {
    fn from(src: EthercatError<()>) -> Self {src.upgrade()}
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::AlError;

    #[test]
    fn display_messages() {
        let err: EthercatError = EthercatError::LengthMismatch {declared: 20, actual: 24};
        assert_eq!(err.to_string(), "frame length mismatch: header declares 20 bytes, datagrams use 24");
        let err: EthercatError = EthercatError::Unresponsive {slave: 3};
        assert_eq!(err.to_string(), "slave 3 is unresponsive");
        let err: EthercatError = std::io::Error::new(std::io::ErrorKind::Other, "link down").into();
        assert_eq!(err.to_string(), "io: link down");
    }

    #[test]
    fn slave_type_conversions() {
        let err: EthercatError<AlError> = EthercatError::Slave(AlError::InvalidStateRequest);
        assert!(matches!(err.clone().downgrade(), EthercatError::Slave(())));
        assert!(matches!(err.map(u16::from), EthercatError::Slave(0x0011)));

        let generic: EthercatError = EthercatError::Timeout("al state");
        let upgraded = EthercatError::<AlError>::from(generic);
        assert!(matches!(upgraded, EthercatError::Timeout("al state")));
    }

    #[test]
    fn containment() {
        assert!(EthercatError::<()>::SdoTimeout.is_contained());
        assert!(EthercatError::<()>::PartialCycleFailure {expected: 3, answered: 2}.is_contained());
        assert!(! EthercatError::<()>::TopologyScanFailed {position: 0}.is_contained());
    }
}

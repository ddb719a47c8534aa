/*!
    Addressing of the slaves' dictionnary objects (SDO), and the engine transferring them through the slaves' mailboxes.

    Transactions are submitted with a [SdoClient], from any task, and progress when the owner of the bus calls [SdoEngine::service] between cycles. Each slave has its own queue: only one transaction per slave is in flight at a time, the others wait in submission order.

    ```ignore
    let client = master.sdo_client();
    let handle = client.read(station, &Sdo::<u16>::sub(0x6041, 0))?;
    // ... the master control loop services the transaction ...
    let status = u16::unpack(&handle.wait().await?)?;
    ```
*/

use core::{
    fmt,
    marker::PhantomData,
    time::Duration,
    };
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
        },
    time::Instant,
    };
use tokio::sync::{mpsc, oneshot};
use crate::{
    rawmaster::RawMaster,
    mailbox::{Mailbox, MailboxType},
    can::{SdoAbortCode, SdoTransfer, Progress},
    data::PduData,
    error::{EthercatError, EthercatResult},
    };


/// description of an SDO's subitem
pub struct Sdo<T: PduData = ()> {
	/// index of the item in the slave's dictionnary of objects
	pub index: u16,
	/// subindex in the item
	pub sub: u8,
	data: PhantomData<T>,
}
impl<T: PduData> Sdo<T> {
	pub const fn sub(index: u16, sub: u8) -> Self {
        Self {index, sub, data: PhantomData}
    }
    /// same address without the type of the value
    pub fn downcast(&self) -> Sdo {
        Sdo::sub(self.index, self.sub)
    }
}
impl<T: PduData> Clone for Sdo<T> {
    fn clone(&self) -> Self  {Self::sub(self.index, self.sub)}
}
impl<T: PduData> Copy for Sdo<T> {}
impl<T: PduData> fmt::Debug for Sdo<T> {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "Sdo {{index: {:#x}, sub: {}}}", self.index, self.sub)
	}
}

/// what a transaction does with its SDO
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SdoOperation {
    Read,
    Write(Vec<u8>),
}

/// progress of a transaction
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum TransactionState {
    /// waiting for the slave's previous transactions
    Queued = 0,
    /// request written in the slave's mailbox
    Sent = 1,
    /// request consumed by the slave, answer not yet received
    AwaitingResponse = 2,
    Complete = 3,
    /// aborted by the slave, timed out or cancelled
    Failed = 4,
}
impl TransactionState {
    fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Queued,
            1 => Self::Sent,
            2 => Self::AwaitingResponse,
            3 => Self::Complete,
            _ => Self::Failed,
        }
    }
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// part of a transaction shared between its handle and the engine
#[derive(Debug)]
struct Shared {
    id: u64,
    state: AtomicU8,
    cancelled: AtomicBool,
}
impl Shared {
    fn set(&self, state: TransactionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// result of a transaction: the value read, or nothing for a write
pub type TransactionResult = EthercatResult<Vec<u8>>;

/**
    handle on a submitted transaction, given to the submitter

    Dropping the handle does not cancel the transaction.
*/
#[derive(Debug)]
pub struct TransactionHandle {
    shared: Arc<Shared>,
    result: oneshot::Receiver<TransactionResult>,
    outcome: Option<TransactionResult>,
}
impl TransactionHandle {
    /// sequence number of the transaction, unique for the engine
    pub fn id(&self) -> u64  {self.shared.id}
    pub fn state(&self) -> TransactionState {
        TransactionState::from_code(self.shared.state.load(Ordering::Acquire))
    }
    /**
        cancel the transaction, if not already finished

        It is dropped at the next service of the engine, and any answer arriving later is discarded.
    */
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }
    /// result of the transaction if finished, without waiting
    pub fn poll(&mut self) -> Option<TransactionResult> {
        if self.outcome.is_none() {
            match self.result.try_recv() {
                Ok(result) => self.outcome = Some(result),
                Err(oneshot::error::TryRecvError::Empty) => {},
                Err(oneshot::error::TryRecvError::Closed) =>
                    self.outcome = Some(Err(EthercatError::Master("sdo engine dropped"))),
            }
        }
        self.outcome.clone()
    }
    /// wait for the result of the transaction
    pub async fn wait(mut self) -> TransactionResult {
        if let Some(outcome) = self.outcome.take()
            {return outcome}
        self.result.await
            .unwrap_or(Err(EthercatError::Master("sdo engine dropped")))
    }
}

/// a transaction as seen by the engine
struct Submission {
    slave: u16,
    sdo: Sdo,
    operation: SdoOperation,
    shared: Arc<Shared>,
    reply: oneshot::Sender<TransactionResult>,
}
impl Submission {
    fn finish(self, result: TransactionResult) {
        match &result {
            Ok(_) => {
                log::debug!("slave {} {:?} transaction {} complete", self.slave, self.sdo, self.shared.id);
                self.shared.set(TransactionState::Complete);
            },
            Err(err) => {
                log::warn!("slave {} {:?} transaction {} failed: {}", self.slave, self.sdo, self.shared.id, err);
                self.shared.set(TransactionState::Failed);
            },
        }
        // the submitter may have dropped its handle
        let _ = self.reply.send(result);
    }
}

/// submits transactions to a [SdoEngine], clones can be sent to other tasks
#[derive(Clone, Debug)]
pub struct SdoClient {
    inbox: mpsc::UnboundedSender<Submission>,
    ids: Arc<AtomicU64>,
}
impl fmt::Debug for Submission {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "Submission {{slave: {}, sdo: {:?}, id: {}}}", self.slave, self.sdo, self.shared.id)
	}
}
impl SdoClient {
    /// submit a transaction on the slave with the given station address, writes must carry at least one byte
    pub fn submit(&self, slave: u16, sdo: Sdo, operation: SdoOperation) -> EthercatResult<TransactionHandle> {
        if matches!(&operation, SdoOperation::Write(data) if data.is_empty())
            {return Err(EthercatError::Master("sdo write needs at least one byte"))}
        let shared = Arc::new(Shared {
            id: self.ids.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(TransactionState::Queued as u8),
            cancelled: AtomicBool::new(false),
        });
        let (reply, result) = oneshot::channel();
        self.inbox.send(Submission {slave, sdo, operation, shared: shared.clone(), reply})
            .map_err(|_| EthercatError::Master("sdo engine dropped"))?;
        Ok(TransactionHandle {shared, result, outcome: None})
    }
    pub fn read<T: PduData>(&self, slave: u16, sdo: &Sdo<T>) -> EthercatResult<TransactionHandle> {
        self.submit(slave, sdo.downcast(), SdoOperation::Read)
    }
    pub fn write<T: PduData>(&self, slave: u16, sdo: &Sdo<T>, value: T) -> EthercatResult<TransactionHandle> {
        let mut data = vec![0; T::packed_size()];
        value.pack(&mut data)?;
        self.submit(slave, sdo.downcast(), SdoOperation::Write(data))
    }
}


/// transaction in flight on a slave
struct Active {
    submission: Submission,
    transfer: SdoTransfer,
    /// CoE payload of the current request
    request: Vec<u8>,
    /// mailbox counter of the current request
    count: u8,
    /// the current request is in the slave's mailbox
    written: bool,
    /// start of the wait for the current step
    since: Instant,
    retries: usize,
}

/// mailbox of one slave with its transactions
struct Channel {
    mailbox: Mailbox,
    queue: VecDeque<Submission>,
    active: Option<Active>,
}

impl Channel {
    /// pick the next transaction in the queue, if none is in flight
    fn start(&mut self) {
        while self.active.is_none() {
            let Some(submission) = self.queue.pop_front()
                else {break};
            if submission.shared.cancelled.load(Ordering::Acquire) {
                submission.finish(Err(EthercatError::Master("transaction cancelled")));
                continue
            }
            let capacity = self.mailbox.capacity();
            let mut transfer = match &submission.operation {
                SdoOperation::Read => SdoTransfer::read(submission.sdo.index, submission.sdo.sub, capacity),
                SdoOperation::Write(data) => SdoTransfer::write(submission.sdo.index, submission.sdo.sub, data.clone(), capacity),
            };
            match transfer.request() {
                Ok(request) => self.active = Some(Active {
                    submission,
                    transfer,
                    request,
                    count: 0,
                    written: false,
                    since: Instant::now(),
                    retries: 0,
                }),
                Err(err) => submission.finish(Err(err)),
            }
        }
    }

    /// one non-blocking step of the transaction in flight
    fn step(&mut self, raw: &mut RawMaster, timeout: Duration, retries: usize) {
        self.start();
        let slave = self.mailbox.slave();
        let Some(active) = self.active.as_mut()
            else {return};

        let outcome = 'step: {
            if active.submission.shared.cancelled.load(Ordering::Acquire) {
                if active.written {
                    // the slave may still answer, the answer will not match any request
                    let count = self.mailbox.next_count();
                    let abort = active.transfer.abort(SdoAbortCode::GeneralError)
                        .and_then(|abort| self.mailbox.write(raw, MailboxType::Can, count, &abort));
                    if let Err(err) = abort {
                        log::debug!("slave {} cannot abort cancelled transaction: {}", slave, err);
                    }
                }
                break 'step Some(Err(EthercatError::Master("transaction cancelled")));
            }

            if ! active.written {
                let count = self.mailbox.next_count();
                match self.mailbox.write(raw, MailboxType::Can, count, &active.request) {
                    Ok(true) => {
                        active.written = true;
                        active.count = count;
                        active.since = Instant::now();
                        active.submission.shared.set(TransactionState::Sent);
                    },
                    Ok(false) => {},
                    Err(err) => log::debug!("slave {} mailbox write failed: {}", slave, err),
                }
                if ! active.written
                    {break 'step Self::expire(slave, active, timeout, retries)}
            }

            match self.mailbox.read(raw) {
                Ok(Some((header, payload))) => {
                    if header.ty != MailboxType::Can || header.count != active.count {
                        log::debug!("slave {} discarding stale mailbox answer (count {}, expected {})",
                            slave, header.count, active.count);
                        break 'step None;
                    }
                    match active.transfer.receive(&payload) {
                        Ok(Progress::Continue) => match active.transfer.request() {
                            Ok(request) => {
                                active.request = request;
                                active.written = false;
                                active.retries = 0;
                                active.since = Instant::now();
                                None
                            },
                            Err(err) => Some(Err(err)),
                        },
                        Ok(Progress::Done(data)) => Some(Ok(data)),
                        Err(err) => Some(Err(err)),
                    }
                },
                Ok(None) => {
                    active.submission.shared.set(TransactionState::AwaitingResponse);
                    Self::expire(slave, active, timeout, retries)
                },
                Err(err) => {
                    log::debug!("slave {} mailbox read failed: {}", slave, err);
                    Self::expire(slave, active, timeout, retries)
                },
            }
        };
        if let Some(result) = outcome {
            if let Some(active) = self.active.take() {
                active.submission.finish(result);
            }
        }
    }

    /// retry the current request if its wait exceeded the timeout, fail after all retries
    fn expire(slave: u16, active: &mut Active, timeout: Duration, retries: usize) -> Option<TransactionResult> {
        if active.since.elapsed() < timeout
            {return None}
        if active.retries >= retries
            {return Some(Err(EthercatError::SdoTimeout))}
        active.retries += 1;
        log::warn!("slave {} no mailbox answer for {:?}, retry {}/{}",
            slave, active.submission.sdo, active.retries, retries);
        active.written = false;
        active.since = Instant::now();
        None
    }

    fn fail_all(&mut self, reason: &'static str) {
        if let Some(active) = self.active.take() {
            active.submission.finish(Err(EthercatError::Master(reason)));
        }
        for submission in self.queue.drain(..) {
            submission.finish(Err(EthercatError::Master(reason)));
        }
    }
}

/**
    Mailbox/SDO engine: routes the submitted transactions to the slaves' mailboxes

    It never waits on the bus: [Self::service] does at most one mailbox step per slave and returns, so it can be called between process data cycles without delaying them.
*/
pub struct SdoEngine {
    inbox: mpsc::UnboundedReceiver<Submission>,
    client: SdoClient,
    channels: BTreeMap<u16, Channel>,
    response_timeout: Duration,
    retries: usize,
    /// first channel serviced at next call, so a deadline cannot starve the same slaves
    rotation: usize,
}

impl SdoEngine {
    /// `response_timeout` bounds the wait of each mailbox step, which is retried `retries` times before [EthercatError::SdoTimeout]
    pub fn new(response_timeout: Duration, retries: usize) -> Self {
        let (sender, inbox) = mpsc::unbounded_channel();
        Self {
            inbox,
            client: SdoClient {inbox: sender, ids: Arc::new(AtomicU64::new(1))},
            channels: BTreeMap::new(),
            response_timeout,
            retries,
            rotation: 0,
        }
    }
    pub fn client(&self) -> SdoClient  {self.client.clone()}

    /// enable transactions on a slave. Its mailbox must be configured
    pub fn add_slave(&mut self, mailbox: Mailbox) {
        let slave = mailbox.slave();
        if let Some(mut previous) = self.channels.insert(slave, Channel {
                mailbox,
                queue: VecDeque::new(),
                active: None,
                }) {
            previous.fail_all("slave mailbox reconfigured");
        }
    }
    /// disable transactions on a slave, its pending transactions fail
    pub fn remove_slave(&mut self, slave: u16) {
        if let Some(mut channel) = self.channels.remove(&slave) {
            channel.fail_all("slave mailbox removed");
        }
    }
    /// remove all slaves
    pub fn clear(&mut self) {
        for channel in self.channels.values_mut() {
            channel.fail_all("slave mailbox removed");
        }
        self.channels.clear();
    }
    /// number of transactions queued or in flight on all slaves
    pub fn pending(&self) -> usize {
        self.channels.values()
            .map(|channel| channel.queue.len() + usize::from(channel.active.is_some()))
            .sum()
    }

    /// route new submissions and progress the transactions in flight, until the given deadline
    pub fn service(&mut self, raw: &mut RawMaster, deadline: Instant) {
        while let Ok(submission) = self.inbox.try_recv() {
            match self.channels.get_mut(&submission.slave) {
                Some(channel) => channel.queue.push_back(submission),
                None => submission.finish(Err(EthercatError::Master("no mailbox for this slave"))),
            }
        }
        let stations: Vec<u16> = self.channels.keys().copied().collect();
        for i in 0 .. stations.len() {
            if Instant::now() >= deadline
                {break}
            let station = stations[(self.rotation + i) % stations.len()];
            if let Some(channel) = self.channels.get_mut(&station) {
                channel.step(raw, self.response_timeout, self.retries);
            }
        }
        self.rotation = self.rotation.wrapping_add(1);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        socket::{SimulatedBus, SimulatedSlave},
        registers::{self, AlControl, AlState},
        mailbox::Buffer,
        };

    /// a slave in PREOP at station 1 and the engine serving it
    fn setup(slave: SimulatedSlave) -> (SimulatedBus, RawMaster, SdoEngine) {
        let bus = SimulatedBus::new(vec![slave]);
        let mut raw = RawMaster::new(bus.clone(), Duration::from_millis(5));
        raw.apwr(0, registers::address::fixed, 1).unwrap().one().unwrap();
        let mailbox = Mailbox::new(1,
            Buffer {address: 0x1000, size: 128},
            Buffer {address: 0x1080, size: 128},
            );
        mailbox.configure(&mut raw).unwrap();
        raw.fpwr(1, registers::al::control, AlControl::request(AlState::PreOperational, false)).unwrap().one().unwrap();
        let mut engine = SdoEngine::new(Duration::from_millis(20), 2);
        engine.add_slave(mailbox);
        (bus, raw, engine)
    }

    fn complete(engine: &mut SdoEngine, raw: &mut RawMaster, handle: &mut TransactionHandle) -> TransactionResult {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            engine.service(raw, deadline);
            if let Some(result) = handle.poll()
                {return result}
        }
        panic!("transaction never finished");
    }

    #[test]
    fn read_write() {
        let (bus, mut raw, mut engine) = setup(SimulatedSlave::new(1, 1)
            .with_object(0x6040, 0, &[0, 0], true)
            .with_object(0x1008, 0, b"a quite long device name, longer than one mailbox frame can carry, \
                so the transfer has to be segmented by both the client and the server of the sdo", false));
        let client = engine.client();

        let mut handle = client.write(1, &Sdo::<u16>::sub(0x6040, 0), 0x000f).unwrap();
        assert_eq!(handle.state(), TransactionState::Queued);
        assert_eq!(complete(&mut engine, &mut raw, &mut handle).unwrap(), []);
        assert_eq!(handle.state(), TransactionState::Complete);
        assert_eq!(bus.object(0, 0x6040, 0).unwrap(), [0x0f, 0]);

        let mut handle = client.read(1, &Sdo::<()>::sub(0x1008, 0)).unwrap();
        let name = complete(&mut engine, &mut raw, &mut handle).unwrap();
        assert_eq!(name, bus.object(0, 0x1008, 0).unwrap());
        assert!(name.len() > 122);
    }

    #[test]
    fn aborted() {
        let (_bus, mut raw, mut engine) = setup(SimulatedSlave::new(1, 1)
            .with_object(0x1000, 0, &[1, 2, 3, 4], false));
        let client = engine.client();

        let mut handle = client.read(1, &Sdo::<u32>::sub(0x2000, 0)).unwrap();
        assert!(matches!(
            complete(&mut engine, &mut raw, &mut handle),
            Err(EthercatError::SdoAborted(SdoAbortCode::InvalidIndex)),
            ));
        assert_eq!(handle.state(), TransactionState::Failed);

        let mut handle = client.write(1, &Sdo::<u32>::sub(0x1000, 0), 5).unwrap();
        assert!(matches!(
            complete(&mut engine, &mut raw, &mut handle),
            Err(EthercatError::SdoAborted(SdoAbortCode::ReadOnly)),
            ));
        // unknown slave
        let mut handle = client.read(7, &Sdo::<u32>::sub(0x1000, 0)).unwrap();
        assert!(matches!(complete(&mut engine, &mut raw, &mut handle), Err(EthercatError::Master(_))));
    }

    #[test]
    fn timeout_and_cancel() {
        let (bus, mut raw, mut engine) = setup(SimulatedSlave::new(1, 1)
            .with_object(0x1000, 0, &[1, 2, 3, 4], false));
        let client = engine.client();
        bus.mute_mailbox(0, true);

        let mut timed = client.read(1, &Sdo::<u32>::sub(0x1000, 0)).unwrap();
        let mut cancelled = client.read(1, &Sdo::<u32>::sub(0x1000, 0)).unwrap();
        cancelled.cancel();
        assert!(matches!(complete(&mut engine, &mut raw, &mut timed), Err(EthercatError::SdoTimeout)));
        // muted slaves do not even count the requests
        assert_eq!(bus.served(0), 0);
        assert!(matches!(complete(&mut engine, &mut raw, &mut cancelled), Err(EthercatError::Master(_))));

        bus.mute_mailbox(0, false);
        let mut handle = client.read(1, &Sdo::<u32>::sub(0x1000, 0)).unwrap();
        assert_eq!(complete(&mut engine, &mut raw, &mut handle).unwrap(), [1, 2, 3, 4]);
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn empty_write() {
        let (bus, mut raw, mut engine) = setup(SimulatedSlave::new(1, 1)
            .with_object(0x6040, 0, &[0, 0], true));
        let client = engine.client();

        assert!(matches!(client.write(1, &Sdo::<()>::sub(0x6040, 0), ()), Err(EthercatError::Master(_))));
        assert!(matches!(
            client.submit(1, Sdo::sub(0x6040, 0), SdoOperation::Write(Vec::new())),
            Err(EthercatError::Master(_)),
            ));
        // nothing reached the slave and the engine still works
        engine.service(&mut raw, Instant::now() + Duration::from_millis(100));
        assert_eq!(bus.served(0), 0);
        let mut handle = client.write(1, &Sdo::<u16>::sub(0x6040, 0), 3).unwrap();
        assert_eq!(complete(&mut engine, &mut raw, &mut handle).unwrap(), []);
    }

    #[test]
    fn duplicate_answer_discarded() {
        let (bus, mut raw, mut engine) = setup(SimulatedSlave::new(1, 1)
            .with_object(0x6040, 0, &[0, 0], true)
            .with_object(0x6041, 0, &[0x37, 0x02], false));
        let client = engine.client();

        // a second copy of the write answer stays in the read mailbox
        bus.duplicate_answers(0, true);
        let mut handle = client.write(1, &Sdo::<u16>::sub(0x6040, 0), 0x000f).unwrap();
        assert_eq!(complete(&mut engine, &mut raw, &mut handle).unwrap(), []);
        bus.duplicate_answers(0, false);

        let mut handle = client.read(1, &Sdo::<u16>::sub(0x6041, 0)).unwrap();
        assert_eq!(complete(&mut engine, &mut raw, &mut handle).unwrap(), [0x37, 0x02]);
        assert_eq!(bus.overlaps(0), 1);
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn late_answer_after_cancel() {
        let (bus, mut raw, mut engine) = setup(SimulatedSlave::new(1, 1)
            .with_object(0x6041, 0, &[0x37, 0x02], false));
        let client = engine.client();

        bus.hold_mailbox(0, true);
        let mut cancelled = client.read(1, &Sdo::<u16>::sub(0x6041, 0)).unwrap();
        engine.service(&mut raw, Instant::now() + Duration::from_millis(100));
        assert_eq!(cancelled.state(), TransactionState::AwaitingResponse);
        cancelled.cancel();
        engine.service(&mut raw, Instant::now() + Duration::from_millis(100));
        assert!(matches!(cancelled.poll(), Some(Err(EthercatError::Master(_)))));
        assert_eq!(cancelled.state(), TransactionState::Failed);

        // the answer to the cancelled request shows up now
        bus.hold_mailbox(0, false);
        let mut handle = client.read(1, &Sdo::<u16>::sub(0x6041, 0)).unwrap();
        assert_eq!(complete(&mut engine, &mut raw, &mut handle).unwrap(), [0x37, 0x02]);
        // the request, the abort of the cancelled transaction, then the new request
        assert_eq!(bus.served(0), 3);
        assert_eq!(bus.overlaps(0), 1);
    }
}

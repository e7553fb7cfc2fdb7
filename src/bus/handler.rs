use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::dump::Dump;
use super::grab::GrabStore;
use super::request::{BusRequest, RequestQueue};
use super::scan::{ParticipantTable, ScanIdent, SCAN_PBSB};
use super::transport::Transport;
use crate::error::{Error, Result};
use crate::logging::{self, Area};
use crate::message::{Message, MessageMap};
use crate::symbol::{SymbolString, TelegramKind, ACK, ESC, NAK, SYN};

// Maximum gap between successive symbols of one telegram.
const BYTE_TIMEOUT_DEFAULT: Duration = Duration::from_millis(10);
// The slave reply must begin within this after the master completed.
const RESPONSE_TIMEOUT_DEFAULT: Duration = Duration::from_millis(10);
// Idle SYN cadence; after twice this of silence the engine generates SYN.
const SYN_PERIOD_DEFAULT: Duration = Duration::from_millis(45);
// Minimum distance between engine initiated polls.
const POLL_INTERVAL_DEFAULT: Duration = Duration::from_secs(5);

const ARBITRATION_RETRIES_DEFAULT: u8 = 2;
const SEND_RETRIES_DEFAULT: u8 = 1;

/// Timing and retry configuration of the protocol engine.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Own master address QQ.
    pub own_address: u8,
    pub byte_timeout: Duration,
    pub response_timeout: Duration,
    pub syn_period: Duration,
    /// Arbitration attempts before a request fails with
    /// `BusArbitrationLost`.
    pub arbitration_retries: u8,
    /// Retransmissions after a slave NAK, and NAKs sent for a bad reply.
    pub send_retries: u8,
    /// Provide SYN when no other master does.
    pub generate_syn: bool,
    pub poll_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> BusConfig {
        BusConfig {
            own_address: 0xFF,
            byte_timeout: BYTE_TIMEOUT_DEFAULT,
            response_timeout: RESPONSE_TIMEOUT_DEFAULT,
            syn_period: SYN_PERIOD_DEFAULT,
            arbitration_retries: ARBITRATION_RETRIES_DEFAULT,
            send_retries: SEND_RETRIES_DEFAULT,
            generate_syn: true,
            poll_interval: POLL_INTERVAL_DEFAULT,
        }
    }
}

/// Role of the engine within the current bus cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BusState {
    Idle = 0,
    Receiving = 1,
    AwaitingArbitration = 2,
    Sending = 3,
    AwaitingReply = 4,
    AwaitingAck = 5,
}

/// Shared live view of the engine for the `state` client command.
#[derive(Debug, Default)]
pub struct BusStatus {
    state: AtomicU8,
    symbols: AtomicU64,
    generating_syn: AtomicBool,
}

impl BusStatus {
    pub fn state(&self) -> BusState {
        match self.state.load(Ordering::Relaxed) {
            1 => BusState::Receiving,
            2 => BusState::AwaitingArbitration,
            3 => BusState::Sending,
            4 => BusState::AwaitingReply,
            5 => BusState::AwaitingAck,
            _ => BusState::Idle,
        }
    }

    pub fn symbols(&self) -> u64 {
        self.symbols.load(Ordering::Relaxed)
    }

    pub fn generating_syn(&self) -> bool {
        self.generating_syn.load(Ordering::Relaxed)
    }
}

/// Observations the engine hands to the dispatcher's notification task.
/// The engine never calls front-end code directly.
#[derive(Debug)]
pub enum UpdateEvent {
    /// A telegram matched a message definition.
    Seen {
        message: Arc<Message>,
        master: SymbolString,
        slave: SymbolString,
        changed: bool,
    },
    /// No message definition matched.
    Unknown {
        master: SymbolString,
        slave: Option<SymbolString>,
    },
    /// An identification reply was decoded.
    ScanResult { address: u8, ident: ScanIdent },
}

/// The unit of work currently owned by the engine: a client request or an
/// engine initiated poll.
#[derive(Debug)]
enum Active {
    Client(BusRequest),
    Poll {
        message: Arc<Message>,
        master: SymbolString,
        kind: TelegramKind,
    },
}

impl Active {
    fn master(&self) -> &SymbolString {
        match self {
            Active::Client(request) => request.master(),
            Active::Poll { master, .. } => master,
        }
    }

    fn kind(&self) -> TelegramKind {
        match self {
            Active::Client(request) => request.kind(),
            Active::Poll { kind, .. } => *kind,
        }
    }
}

enum Attempt {
    /// Exchange completed; the slave reply is empty for broadcast and
    /// master-master telegrams.
    Done(SymbolString),
    /// Arbitration lost. `prior` marks the matching-sub-priority case that
    /// retries without counting against the budget.
    Lost { prior: bool, winner_byte: u8 },
}

/// The protocol engine: a single-threaded state machine fed one symbol at
/// a time by the transport it exclusively owns.
pub struct BusHandler<T: Transport> {
    transport: T,
    config: BusConfig,
    catalog: Arc<RwLock<Arc<MessageMap>>>,
    queue: Arc<RequestQueue>,
    updates: Sender<UpdateEvent>,
    participants: Arc<Mutex<ParticipantTable>>,
    grab: Arc<Mutex<GrabStore>>,
    status: Arc<BusStatus>,
    dump: Option<Dump>,
    stop: Arc<AtomicBool>,

    accumulator: SymbolString,
    escape: bool,
    bad_telegram: bool,
    current: Option<Active>,
    arbitration_retry: u8,
    last_poll_at: Option<Instant>,
}

impl<T: Transport> BusHandler<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: T,
        config: BusConfig,
        catalog: Arc<RwLock<Arc<MessageMap>>>,
        queue: Arc<RequestQueue>,
        updates: Sender<UpdateEvent>,
        participants: Arc<Mutex<ParticipantTable>>,
        grab: Arc<Mutex<GrabStore>>,
        status: Arc<BusStatus>,
        stop: Arc<AtomicBool>,
    ) -> BusHandler<T> {
        BusHandler {
            transport,
            config,
            catalog,
            queue,
            updates,
            participants,
            grab,
            status,
            dump: None,
            stop,
            accumulator: SymbolString::master(),
            escape: false,
            bad_telegram: false,
            current: None,
            arbitration_retry: 0,
            last_poll_at: None,
        }
    }

    /// Attaches a raw dump of the received byte stream.
    pub fn with_dump(mut self, dump: Dump) -> Self {
        self.dump = Some(dump);
        self
    }

    fn set_state(&self, state: BusState) {
        self.status.state.store(state as u8, Ordering::Relaxed);
    }

    /// Runs until stopped. Transport failures pause the engine with an
    /// exponential backoff up to a cap.
    pub fn run(&mut self) {
        info!(
            "bus engine started, own address {:02x}",
            self.config.own_address
        );
        let mut backoff = Duration::from_millis(100);
        while !self.stop.load(Ordering::Acquire) {
            match self.run_once() {
                Ok(()) => {
                    backoff = Duration::from_millis(100);
                }
                Err(Error::DeviceIo(detail)) => {
                    warn!("device failed ({}), pausing {:?}", detail, backoff);
                    self.fail_current(Error::DeviceIo(detail));
                    self.reset_receive();
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_secs(10));
                }
                Err(error) => {
                    debug!("bus cycle failed: {}", error);
                }
            }
        }
        self.fail_current(Error::Canceled);
        info!("bus engine stopped");
    }

    /// Processes one transport event: a symbol or a silence window.
    pub fn run_once(&mut self) -> Result<()> {
        let timeout = if !self.accumulator.is_empty() || self.escape {
            self.config.byte_timeout
        } else {
            2 * self.config.syn_period
        };
        match self.read_byte(timeout) {
            Ok(byte) => self.on_symbol(byte),
            Err(Error::DeviceTimeout) => self.on_silence(),
            Err(error) => Err(error),
        }
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<u8> {
        let byte = self.transport.read_byte(timeout)?;
        self.status.symbols.fetch_add(1, Ordering::Relaxed);
        if let Some(dump) = &mut self.dump {
            if let Err(error) = dump.write(byte) {
                debug!("dump write failed: {}", error);
            }
        }
        Ok(byte)
    }

    fn on_silence(&mut self) -> Result<()> {
        if !self.accumulator.is_empty() || self.escape {
            debug!("dropping partial telegram after byte timeout");
            self.reset_receive();
            return Ok(());
        }
        if self.config.generate_syn {
            if !self.status.generating_syn.load(Ordering::Relaxed) {
                info!("no SYN observed, providing the signal");
                self.status.generating_syn.store(true, Ordering::Relaxed);
            }
            // the echo comes back through the regular read path
            self.transport.write_byte(SYN)?;
        }
        Ok(())
    }

    fn reset_receive(&mut self) {
        self.accumulator.clear();
        self.escape = false;
        self.bad_telegram = false;
        self.set_state(BusState::Idle);
    }

    fn on_symbol(&mut self, byte: u8) -> Result<()> {
        if byte == SYN {
            if self.escape {
                // trailing escape, the telegram is incomplete
                self.bad_telegram = true;
            }
            if !self.accumulator.is_empty() {
                self.status.generating_syn.store(false, Ordering::Relaxed);
                if self.bad_telegram {
                    debug!("dropping malformed telegram {}", self.accumulator);
                } else {
                    self.route_passive();
                }
            }
            self.reset_receive();
            return self.on_syn();
        }
        if self.accumulator.is_empty() && !self.escape {
            self.set_state(BusState::Receiving);
        }
        if logging::enabled(Area::Bus, log::Level::Trace) {
            log::trace!("symbol {:02x}", byte);
        }
        match self.accumulator.push_unescape(byte, &mut self.escape) {
            Ok(_) => Ok(()),
            Err(Error::InvalidEscape) => {
                self.bad_telegram = true;
                self.escape = false;
                Ok(())
            }
            Err(_) => {
                self.bad_telegram = true;
                Ok(())
            }
        }
    }

    /// Parses the symbols accumulated between two SYNs and routes the
    /// exchange to the catalog, participants and grab store.
    fn route_passive(&mut self) {
        let bytes: Vec<u8> = self.accumulator.to_vec();
        if bytes.len() < 5 {
            debug!("short telegram {}", self.accumulator);
            return;
        }
        let nn = bytes[4] as usize;
        let master_len = 5 + nn;
        if bytes.len() < master_len + 1 {
            debug!("truncated telegram {}", self.accumulator);
            return;
        }
        if bytes[master_len] != self.accumulator.crc_over(0, master_len) {
            info!("CRC mismatch in {}", self.accumulator);
            return;
        }
        let mut master = SymbolString::master();
        for &byte in &bytes[..master_len] {
            if master.push(byte).is_err() {
                return;
            }
        }
        let source = master.source().unwrap_or(0);
        let destination = master.destination().unwrap_or(0);
        let slave = match TelegramKind::of(destination) {
            TelegramKind::Broadcast => None,
            TelegramKind::MasterMaster => None,
            TelegramKind::MasterSlave => {
                if bytes.get(master_len + 1) != Some(&ACK) {
                    debug!("master telegram {} not acknowledged", master);
                    return;
                }
                let reply_start = master_len + 2;
                let reply_nn = match bytes.get(reply_start) {
                    Some(&nn) => nn as usize,
                    None => {
                        debug!("missing slave reply in {}", self.accumulator);
                        return;
                    }
                };
                let crc_at = reply_start + 1 + reply_nn;
                if bytes.len() < crc_at + 1 {
                    debug!("truncated slave reply in {}", self.accumulator);
                    return;
                }
                if bytes[crc_at] != self.accumulator.crc_over(reply_start, crc_at) {
                    info!("slave CRC mismatch in {}", self.accumulator);
                    return;
                }
                let mut slave = SymbolString::slave();
                for &byte in &bytes[reply_start..crc_at] {
                    if slave.push(byte).is_err() {
                        return;
                    }
                }
                Some(slave)
            }
        };

        {
            let mut participants = self.participants.lock().unwrap();
            participants.saw_master(source);
            participants.saw_slave(destination);
        }
        if master.pb() == Some(SCAN_PBSB[0]) && master.sb() == Some(SCAN_PBSB[1]) {
            if let Some(slave) = &slave {
                if let Ok(ident) = ScanIdent::parse(slave) {
                    debug!("scan result for {:02x}: {}", destination, ident);
                    self.participants
                        .lock()
                        .unwrap()
                        .set_ident(destination, ident.clone());
                    let _ = self.updates.send(UpdateEvent::ScanResult {
                        address: destination,
                        ident,
                    });
                }
            }
        }

        let map = self.catalog.read().unwrap().clone();
        match map.find_for_master(&master) {
            Some((message, _chunk)) => {
                let reply = slave.clone().unwrap_or_else(SymbolString::slave);
                let changed = message.update_seen(&master, &reply, Instant::now());
                if logging::enabled(Area::Update, log::Level::Debug) {
                    debug!(
                        "update {} {} from {}",
                        message.circuit(),
                        message.name(),
                        master
                    );
                }
                self.grab.lock().unwrap().store(master.clone(), slave, true);
                let _ = self.updates.send(UpdateEvent::Seen {
                    message,
                    master,
                    slave: reply,
                    changed,
                });
            }
            None => {
                self.grab
                    .lock()
                    .unwrap()
                    .store(master.clone(), slave.clone(), false);
                let _ = self.updates.send(UpdateEvent::Unknown { master, slave });
            }
        }
    }

    /// Bus idle: take the next request (or a due poll) and arbitrate.
    fn on_syn(&mut self) -> Result<()> {
        if self.current.is_none() {
            if let Some(request) = self.queue.pop() {
                self.arbitration_retry = 0;
                self.current = Some(Active::Client(request));
            } else if let Some(poll) = self.due_poll() {
                self.arbitration_retry = 0;
                self.current = Some(poll);
            }
        }
        let Some(active) = self.current.take() else {
            return Ok(());
        };
        if let Active::Client(request) = &active {
            if request.is_canceled() {
                if let Active::Client(request) = active {
                    request.complete(Err(Error::Canceled));
                }
                return Ok(());
            }
        }

        self.set_state(BusState::AwaitingArbitration);
        match self.attempt(&active) {
            Ok(Attempt::Done(reply)) => {
                self.finish(active, Ok(reply));
                Ok(())
            }
            Ok(Attempt::Lost { prior, winner_byte }) => {
                if !prior {
                    self.arbitration_retry += 1;
                }
                if self.arbitration_retry > self.config.arbitration_retries {
                    self.finish(active, Err(Error::BusArbitrationLost));
                } else {
                    debug!(
                        "arbitration lost ({}), retrying at next SYN",
                        if prior { "matching sub-priority" } else { "other master" }
                    );
                    self.current = Some(active);
                }
                // the winner's first symbol belongs to its telegram
                if winner_byte != SYN {
                    self.set_state(BusState::Receiving);
                    let mut escape = self.escape;
                    let result = self.accumulator.push_unescape(winner_byte, &mut escape);
                    self.escape = escape;
                    if result.is_err() {
                        self.bad_telegram = true;
                    }
                }
                Ok(())
            }
            Err(error) => {
                self.finish(active, Err(error.clone()));
                self.set_state(BusState::Idle);
                Err(error)
            }
        }
    }

    /// One bus acquisition and exchange attempt for the active request.
    fn attempt(&mut self, active: &Active) -> Result<Attempt> {
        let master = active.master().clone();
        let source = master.get(0).ok_or(Error::InvalidPos)?;
        self.transport.write_byte(source)?;
        let echo = self.read_byte(self.config.byte_timeout)?;
        if echo != source {
            // SYN instead of the echo means the cycle collapsed; retry at
            // the next SYN without burning the budget
            let prior = echo == SYN || echo & 0x0F == source & 0x0F;
            return Ok(Attempt::Lost {
                prior,
                winner_byte: echo,
            });
        }

        // arbitration won, send the remainder of the master telegram
        self.set_state(BusState::Sending);
        self.send_master_tail(&master)?;
        match active.kind() {
            TelegramKind::Broadcast => {
                self.write_checked(SYN)?;
                Ok(Attempt::Done(SymbolString::slave()))
            }
            TelegramKind::MasterMaster => {
                self.await_ack(&master)?;
                self.write_checked(SYN)?;
                Ok(Attempt::Done(SymbolString::slave()))
            }
            TelegramKind::MasterSlave => {
                self.await_ack(&master)?;
                self.set_state(BusState::AwaitingReply);
                let mut nak_budget = self.config.send_retries;
                loop {
                    match self.receive_slave_reply() {
                        Ok(reply) => {
                            self.write_checked(ACK)?;
                            self.write_checked(SYN)?;
                            return Ok(Attempt::Done(reply));
                        }
                        Err(Error::BadCrc) if nak_budget > 0 => {
                            nak_budget -= 1;
                            self.write_checked(NAK)?;
                        }
                        Err(error) => {
                            let _ = self.write_checked(SYN);
                            return Err(error);
                        }
                    }
                }
            }
        }
    }

    /// Sends everything after QQ plus the CRC, each symbol echo-verified.
    fn send_master_tail(&mut self, master: &SymbolString) -> Result<()> {
        for index in 1..master.len() {
            self.send_symbol(master.get(index).ok_or(Error::InvalidPos)?)?;
        }
        self.send_symbol(master.crc())
    }

    /// Waits for the destination's ACK, retransmitting after a NAK within
    /// the retry budget.
    fn await_ack(&mut self, master: &SymbolString) -> Result<()> {
        self.set_state(BusState::AwaitingAck);
        let mut tries = self.config.send_retries + 1;
        loop {
            let answer = self.read_byte(self.config.response_timeout)?;
            match answer {
                ACK => return Ok(()),
                SYN => {
                    debug!("SYN while awaiting ACK, aborting send");
                    return Err(Error::BusTransmit);
                }
                NAK => {
                    tries -= 1;
                    if tries == 0 {
                        let _ = self.write_checked(SYN);
                        return Err(Error::SlaveNakReceived);
                    }
                    debug!("NAK received, retransmitting");
                    for index in 0..master.len() {
                        self.send_symbol(master.get(index).ok_or(Error::InvalidPos)?)?;
                    }
                    self.send_symbol(master.crc())?;
                }
                other => {
                    debug!("unexpected answer {:02x} instead of ACK", other);
                    return Err(Error::BusTransmit);
                }
            }
        }
    }

    /// Receives NN, payload and CRC of the slave reply, unescaping and
    /// verifying the checksum.
    fn receive_slave_reply(&mut self) -> Result<SymbolString> {
        let mut reply = SymbolString::slave();
        let mut escape = false;
        let nn = loop {
            let byte = self.read_byte(self.config.response_timeout)?;
            if let Some(symbol) = reply.push_unescape(byte, &mut escape)? {
                break symbol as usize;
            }
        };
        let mut received = 0;
        while received < nn {
            let byte = self.read_byte(self.config.byte_timeout)?;
            if reply.push_unescape(byte, &mut escape)?.is_some() {
                received += 1;
            }
        }
        let calculated = reply.crc();
        let mut escape = false;
        let crc = loop {
            let byte = self.read_byte(self.config.byte_timeout)?;
            if let Some(symbol) = crate::symbol::unescape(byte, &mut escape)? {
                break symbol;
            }
        };
        if crc != calculated {
            return Err(Error::BadCrc);
        }
        Ok(reply)
    }

    /// Writes one raw symbol and verifies the wired-OR echo.
    fn write_checked(&mut self, byte: u8) -> Result<()> {
        self.transport.write_byte(byte)?;
        let echo = self.read_byte(self.config.byte_timeout)?;
        if echo != byte {
            debug!("echo mismatch: sent {:02x}, read {:02x}", byte, echo);
            return Err(Error::BusTransmit);
        }
        Ok(())
    }

    /// Writes one logical symbol in escaped form.
    fn send_symbol(&mut self, value: u8) -> Result<()> {
        match value {
            ESC => {
                self.write_checked(ESC)?;
                self.write_checked(0x00)
            }
            SYN => {
                self.write_checked(ESC)?;
                self.write_checked(0x01)
            }
            _ => self.write_checked(value),
        }
    }

    /// Completes the active unit of work.
    fn finish(&mut self, active: Active, result: Result<SymbolString>) {
        self.arbitration_retry = 0;
        self.set_state(BusState::Idle);
        match active {
            Active::Client(request) => request.complete(result),
            Active::Poll {
                message, master, ..
            } => match result {
                Ok(reply) => {
                    let changed = message.update_seen(&master, &reply, Instant::now());
                    debug!("poll {} {} done", message.circuit(), message.name());
                    let _ = self.updates.send(UpdateEvent::Seen {
                        message,
                        master,
                        slave: reply,
                        changed,
                    });
                }
                Err(error) => {
                    debug!(
                        "poll {} {} failed: {}",
                        message.circuit(),
                        message.name(),
                        error
                    );
                }
            },
        }
    }

    fn fail_current(&mut self, error: Error) {
        if let Some(active) = self.current.take() {
            self.finish(active, Err(error));
        }
    }

    /// The next due poll target, honoring the poll interval and any
    /// condition gating the selected message.
    fn due_poll(&mut self) -> Option<Active> {
        let now = Instant::now();
        if let Some(last) = self.last_poll_at {
            if now.saturating_duration_since(last) < self.config.poll_interval {
                return None;
            }
        }
        let map = self.catalog.read().unwrap().clone();
        let message = map.next_poll(now)?;
        message.mark_polled(now);
        self.last_poll_at = Some(now);
        if let Some(name) = message.condition() {
            let satisfied = map
                .condition(name)
                .map(|condition| condition.evaluate(&map).unwrap_or(false))
                .unwrap_or(false);
            if !satisfied {
                return None;
            }
        }
        let master = message.prepare(self.config.own_address, "", 0).ok()?;
        let kind = TelegramKind::of(master.destination().unwrap_or(0));
        Some(Active::Poll {
            message,
            master,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::tests_support::simple_message;
    use crate::message::Direction;
    use crate::symbol::{crc_add_escaped, Part};
    use std::collections::VecDeque;
    use std::sync::mpsc;

    /// Scripted transport: reads come from a queue, writes are recorded
    /// and echoed back (wired-OR), unless an override replaces the echo.
    struct ScriptTransport {
        reads: VecDeque<u8>,
        written: Vec<u8>,
        echo_overrides: VecDeque<Option<u8>>,
    }

    impl ScriptTransport {
        fn new(reads: &[u8]) -> ScriptTransport {
            ScriptTransport {
                reads: reads.iter().copied().collect(),
                written: Vec::new(),
                echo_overrides: VecDeque::new(),
            }
        }

        fn override_next_echo(&mut self, byte: u8) {
            self.echo_overrides.push_back(Some(byte));
        }
    }

    impl Transport for ScriptTransport {
        fn read_byte(&mut self, _timeout: Duration) -> Result<u8> {
            self.reads.pop_front().ok_or(Error::DeviceTimeout)
        }

        fn write_byte(&mut self, byte: u8) -> Result<()> {
            self.written.push(byte);
            let echo = match self.echo_overrides.pop_front() {
                Some(Some(replacement)) => replacement,
                _ => byte,
            };
            self.reads.push_front(echo);
            Ok(())
        }
    }

    struct Fixture {
        catalog: Arc<RwLock<Arc<MessageMap>>>,
        queue: Arc<RequestQueue>,
        events: mpsc::Receiver<UpdateEvent>,
        participants: Arc<Mutex<ParticipantTable>>,
        grab: Arc<Mutex<GrabStore>>,
        status: Arc<BusStatus>,
        stop: Arc<AtomicBool>,
    }

    fn fixture(map: MessageMap) -> (Fixture, Sender<UpdateEvent>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (tx, rx) = mpsc::channel();
        (
            Fixture {
                catalog: Arc::new(RwLock::new(Arc::new(map))),
                queue: Arc::new(RequestQueue::new(8)),
                events: rx,
                participants: Arc::new(Mutex::new(ParticipantTable::new())),
                grab: Arc::new(Mutex::new(GrabStore::new())),
                status: Arc::new(BusStatus::default()),
                stop: Arc::new(AtomicBool::new(false)),
            },
            tx,
        )
    }

    fn handler(
        fixture: &Fixture,
        tx: Sender<UpdateEvent>,
        transport: ScriptTransport,
        config: BusConfig,
    ) -> BusHandler<ScriptTransport> {
        BusHandler::new(
            transport,
            config,
            fixture.catalog.clone(),
            fixture.queue.clone(),
            tx,
            fixture.participants.clone(),
            fixture.grab.clone(),
            fixture.status.clone(),
            fixture.stop.clone(),
        )
    }

    fn crc_of(bytes: &[u8]) -> u8 {
        bytes.iter().fold(0, |crc, &b| crc_add_escaped(crc, b))
    }

    fn drain(handler: &mut BusHandler<ScriptTransport>) {
        while handler.run_once().is_ok() {
            if handler.transport.reads.is_empty() {
                break;
            }
        }
    }

    #[test]
    fn master_slave_read_succeeds() {
        let (fixture, tx) = fixture(MessageMap::new());
        let master =
            SymbolString::parse_hex(Part::Master, "ff08b509030d2900", false).unwrap();
        let (request, handle) = BusRequest::new(master, super::super::request::Priority::Read);
        fixture.queue.push(request);

        // slave: ACK, then NN=3 payload CRC
        let reply = [0x03, 0x14, 0x11, 0x23];
        let mut reads = vec![SYN, ACK];
        reads.extend_from_slice(&reply);
        reads.push(crc_of(&reply));
        let transport = ScriptTransport::new(&reads);
        let mut config = BusConfig::default();
        config.poll_interval = Duration::from_secs(3600);
        let mut bus = handler(&fixture, tx, transport, config);

        drain(&mut bus);
        let reply = handle.wait(Duration::from_millis(100)).unwrap();
        assert_eq!(reply.payload(), &[0x14, 0x11, 0x23]);
        // the wire saw the full master telegram, the final ACK and SYN
        let sent = [0xFF, 0x08, 0xB5, 0x09, 0x03, 0x0D, 0x29, 0x00];
        let written = &bus.transport.written;
        assert_eq!(&written[..8], &sent);
        assert_eq!(written[8], crc_of(&sent));
        assert_eq!(written[written.len() - 2], ACK);
        assert_eq!(written[written.len() - 1], SYN);
    }

    #[test]
    fn arbitration_loss_then_passive_capture_then_win() {
        let mut map = MessageMap::new();
        map.add(simple_message(
            "cir",
            "mode",
            Direction::UPDATE,
            0xFE,
            &[0xB5, 0x05],
            0,
        ))
        .unwrap();
        let (fixture, tx) = fixture(map);

        // own master-master request from QQ 0x03 to 0x10
        let master = SymbolString::parse_hex(Part::Master, "0310b5050100", false).unwrap();
        let (request, handle) = BusRequest::new(master, super::super::request::Priority::Write);
        fixture.queue.push(request);

        // winner telegram: broadcast from QQ 0x07
        let winner_body = [0x07, 0xFE, 0xB5, 0x05, 0x02, 0x01, 0x03];
        let mut reads = vec![SYN];
        // after our QQ the winner's remaining bytes follow
        reads.extend_from_slice(&winner_body[1..]);
        reads.push(crc_of(&winner_body));
        reads.push(SYN);
        // second round: we win (auto echo), destination ACKs
        reads.push(ACK);
        let mut transport = ScriptTransport::new(&reads);
        // the first arbitration returns the winner's QQ instead of ours
        transport.override_next_echo(0x07);

        let mut config = BusConfig::default();
        config.poll_interval = Duration::from_secs(3600);
        let mut bus = handler(&fixture, tx, transport, config);
        drain(&mut bus);

        // the request completed after the retry
        handle.wait(Duration::from_millis(100)).unwrap();
        // the winner's telegram was captured passively
        match fixture.events.try_recv().unwrap() {
            UpdateEvent::Seen {
                message, changed, ..
            } => {
                assert_eq!(message.name(), "mode");
                assert!(changed);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn matching_sub_priority_never_burns_the_budget() {
        let (fixture, tx) = fixture(MessageMap::new());
        let master = SymbolString::parse_hex(Part::Master, "0310b5050100", false).unwrap();
        let (request, handle) = BusRequest::new(master, super::super::request::Priority::Write);
        fixture.queue.push(request);

        // lose to QQ 0x13 (same low nibble) more often than the retry
        // budget would allow for plain losses, then win
        let winner = [0x13, 0xFE, 0xB5, 0x05, 0x01, 0x00];
        let mut reads = Vec::new();
        for _ in 0..4 {
            reads.push(SYN);
            reads.extend_from_slice(&winner[1..]);
            reads.push(crc_of(&winner));
        }
        reads.push(SYN);
        reads.push(ACK);
        let mut transport = ScriptTransport::new(&reads);
        for _ in 0..4 {
            transport.override_next_echo(0x13);
        }
        let mut config = BusConfig::default();
        config.poll_interval = Duration::from_secs(3600);
        let mut bus = handler(&fixture, tx, transport, config);
        drain(&mut bus);

        handle.wait(Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn empty_payload_telegram_matches() {
        let mut map = MessageMap::new();
        map.add(simple_message(
            "cir",
            "ping",
            Direction::UPDATE,
            0xFE,
            &[0xB5, 0x05],
            0,
        ))
        .unwrap();
        let (fixture, tx) = fixture(map);
        // NN = 0: header and CRC only
        let body = [0x10, 0xFE, 0xB5, 0x05, 0x00];
        let mut reads = vec![SYN];
        reads.extend_from_slice(&body);
        reads.push(crc_of(&body));
        reads.push(SYN);
        let transport = ScriptTransport::new(&reads);
        let mut config = BusConfig::default();
        config.poll_interval = Duration::from_secs(3600);
        let mut bus = handler(&fixture, tx, transport, config);
        drain(&mut bus);
        match fixture.events.try_recv().unwrap() {
            UpdateEvent::Seen { message, .. } => assert_eq!(message.name(), "ping"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn arbitration_budget_exhausts() {
        let (fixture, tx) = fixture(MessageMap::new());
        let master = SymbolString::parse_hex(Part::Master, "0310b5050100", false).unwrap();
        let (request, handle) = BusRequest::new(master, super::super::request::Priority::Write);
        fixture.queue.push(request);

        // every arbitration round is lost to QQ 0x10 (different low nibble)
        let winner = [0x10, 0xFE, 0xB5, 0x05, 0x01, 0x00];
        let mut reads = Vec::new();
        for _ in 0..3 {
            reads.push(SYN);
            reads.extend_from_slice(&winner[1..]);
            reads.push(crc_of(&winner));
        }
        reads.push(SYN);
        let mut transport = ScriptTransport::new(&reads);
        for _ in 0..3 {
            transport.override_next_echo(0x10);
        }
        let mut config = BusConfig::default();
        config.poll_interval = Duration::from_secs(3600);
        let mut bus = handler(&fixture, tx, transport, config);
        drain(&mut bus);

        assert_eq!(
            handle.wait(Duration::from_millis(100)),
            Err(Error::BusArbitrationLost)
        );
    }

    #[test]
    fn slave_nak_exhausts_retries() {
        let (fixture, tx) = fixture(MessageMap::new());
        let master =
            SymbolString::parse_hex(Part::Master, "ff08b509030d2900", false).unwrap();
        let (request, handle) = BusRequest::new(master, super::super::request::Priority::Read);
        fixture.queue.push(request);

        let reads = vec![SYN, NAK, NAK];
        let transport = ScriptTransport::new(&reads);
        let mut config = BusConfig::default();
        config.poll_interval = Duration::from_secs(3600);
        let mut bus = handler(&fixture, tx, transport, config);
        drain(&mut bus);

        assert_eq!(
            handle.wait(Duration::from_millis(100)),
            Err(Error::SlaveNakReceived)
        );
        // the master telegram went out twice
        let sent = &bus.transport.written;
        let first = sent.iter().filter(|&&b| b == 0xB5).count();
        assert_eq!(first, 2);
    }

    #[test]
    fn generates_syn_on_silent_bus() {
        let (fixture, tx) = fixture(MessageMap::new());
        let transport = ScriptTransport::new(&[]);
        let mut bus = handler(&fixture, tx, transport, BusConfig::default());
        // silence: engine provides SYN, echo comes back as a regular symbol
        bus.run_once().unwrap();
        assert_eq!(bus.transport.written, vec![SYN]);
        assert!(fixture.status.generating_syn());
        bus.run_once().unwrap();
        assert_eq!(fixture.status.state(), BusState::Idle);
    }

    #[test]
    fn idle_bus_polls_due_message() {
        let mut map = MessageMap::new();
        map.add(simple_message(
            "cir",
            "temp",
            Direction::READ,
            0x08,
            &[0xB5, 0x09, 0x0D],
            1,
        ))
        .unwrap();
        let (fixture, tx) = fixture(map);

        let reply = [0x01, 0x26];
        let mut reads = vec![SYN, ACK];
        reads.extend_from_slice(&reply);
        reads.push(crc_of(&reply));
        let transport = ScriptTransport::new(&reads);
        let mut config = BusConfig::default();
        config.poll_interval = Duration::ZERO;
        let mut bus = handler(&fixture, tx, transport, config);
        drain(&mut bus);

        let map = fixture.catalog.read().unwrap().clone();
        let message = map.get(Some("cir"), "temp", false).unwrap();
        message.with_state(|state| {
            assert_eq!(state.poll_count, 1);
            assert!(state.last_update.is_some());
        });
        assert_eq!(
            message
                .decode_last(crate::field::OutputFormat::default(), None)
                .unwrap(),
            "38"
        );
    }

    #[test]
    fn passive_bad_crc_is_dropped() {
        let mut map = MessageMap::new();
        map.add(simple_message(
            "cir",
            "mode",
            Direction::UPDATE,
            0xFE,
            &[0xB5, 0x05],
            0,
        ))
        .unwrap();
        let (fixture, tx) = fixture(map);
        let body = [0x10, 0xFE, 0xB5, 0x05, 0x01, 0x03];
        let mut reads = vec![SYN];
        reads.extend_from_slice(&body);
        reads.push(crc_of(&body) ^ 0xFF);
        reads.push(SYN);
        let transport = ScriptTransport::new(&reads);
        let mut config = BusConfig::default();
        config.poll_interval = Duration::from_secs(3600);
        let mut bus = handler(&fixture, tx, transport, config);
        drain(&mut bus);
        assert!(fixture.events.try_recv().is_err());
        // the engine resynchronized
        assert_eq!(fixture.status.state(), BusState::Idle);
    }

    #[test]
    fn escaped_symbols_in_passive_telegram() {
        let (fixture, tx) = fixture(MessageMap::new());
        // broadcast carrying the value 0xA9 (escaped on the wire)
        let logical = [0x10, 0xFE, 0xB5, 0x05, 0x01, 0xA9];
        let crc = crc_of(&logical);
        let mut reads = vec![SYN, 0x10, 0xFE, 0xB5, 0x05, 0x01, ESC, 0x00];
        reads.push(crc);
        reads.push(SYN);
        let transport = ScriptTransport::new(&reads);
        let mut config = BusConfig::default();
        config.poll_interval = Duration::from_secs(3600);
        let mut bus = handler(&fixture, tx, transport, config);
        drain(&mut bus);
        match fixture.events.try_recv().unwrap() {
            UpdateEvent::Unknown { master, .. } => {
                assert_eq!(master.payload(), &[0xA9]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}

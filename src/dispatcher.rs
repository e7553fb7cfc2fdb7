//! The dispatcher: accepts client requests, serializes bus access through
//! the request queue, delivers responses and fans passive updates out to
//! subscribers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::bus::{
    scan_addresses, scan_telegram, BusConfig, BusHandler, BusRequest, BusStatus, Dump, GrabStore,
    ParticipantTable, Priority, RequestQueue, ScanIdent, Transport, UpdateEvent,
};
use crate::error::{Error, Result};
use crate::field::OutputFormat;
use crate::message::{Message, MessageMap};
use crate::symbol::{self, SymbolString, TelegramKind};
use crate::util::glob_match;

/// How long a submitter waits for its request before canceling it.
const REQUEST_TIMEOUT_DEFAULT: Duration = Duration::from_secs(5);
/// A condition reference older than this is refreshed before evaluation.
const CONDITION_MAX_AGE: Duration = Duration::from_secs(300);

/// A decoded passive update delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct UpdateNotice {
    pub circuit: String,
    pub name: String,
    pub value: String,
    pub changed: bool,
}

struct Subscription {
    circuit_glob: String,
    name_glob: String,
    sink: Sender<UpdateNotice>,
}

/// Front-end entry points. All bus access funnels through the bounded
/// request queue; the dispatcher never touches engine state directly.
pub struct Dispatcher {
    catalog: Arc<RwLock<Arc<MessageMap>>>,
    queue: Arc<RequestQueue>,
    own_address: u8,
    request_timeout: Duration,
    participants: Arc<Mutex<ParticipantTable>>,
    grab: Arc<Mutex<GrabStore>>,
    status: Arc<BusStatus>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
}

impl Dispatcher {
    fn map(&self) -> Arc<MessageMap> {
        self.catalog.read().unwrap().clone()
    }

    /// Swaps in a freshly loaded catalog; the bus thread picks up the new
    /// pointer at its next access.
    pub fn reload(&self, map: MessageMap) {
        *self.catalog.write().unwrap() = Arc::new(map);
        info!("catalog replaced");
    }

    fn submit(&self, master: SymbolString, priority: Priority) -> Result<SymbolString> {
        let (request, handle) = BusRequest::new(master, priority);
        self.queue.push(request);
        match handle.wait(self.request_timeout) {
            Err(Error::DeviceTimeout) => {
                handle.cancel();
                Err(Error::DeviceTimeout)
            }
            other => other,
        }
    }

    /// Performs the bus exchange(s) for a read message and stores the
    /// result. Chained messages concatenate the per-chunk slave payloads
    /// in declared order before decoding.
    fn fetch(&self, message: &Arc<Message>) -> Result<()> {
        let master = message.prepare(self.own_address, "", 0)?;
        let reply = if message.chain_len() > 1 {
            let mut payload: Vec<u8> = Vec::new();
            payload.extend_from_slice(self.submit(master.clone(), Priority::Read)?.payload());
            for chunk in 1..message.chain_len() {
                let chunk_master = message.prepare(self.own_address, "", chunk)?;
                let chunk_reply = self.submit(chunk_master, Priority::Read)?;
                payload.extend_from_slice(chunk_reply.payload());
            }
            let mut combined = SymbolString::slave();
            combined.push(0)?;
            for byte in payload {
                combined.push(byte)?;
            }
            combined.finish_payload()?;
            combined
        } else {
            self.submit(master.clone(), Priority::Read)?
        };
        message.update_seen(&master, &reply, Instant::now());
        Ok(())
    }

    /// Ensures the condition gating `message` holds, refreshing a stale
    /// reference once.
    fn check_condition(&self, map: &MessageMap, message: &Arc<Message>) -> Result<()> {
        let Some(name) = message.condition() else {
            return Ok(());
        };
        let condition = map
            .condition(name)
            .ok_or_else(|| Error::not_found(format!("condition {}", name)))?;
        let (circuit, reference_name) = condition.reference();
        let reference = map.get(Some(circuit), reference_name, false);
        let stale = reference
            .as_ref()
            .map(|m| {
                m.age(Instant::now())
                    .map_or(true, |age| age > CONDITION_MAX_AGE)
            })
            .unwrap_or(true);
        if stale {
            if let Some(reference) = &reference {
                if !reference.direction().passive {
                    self.fetch(reference)?;
                }
            }
        }
        match condition.evaluate(map) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::not_found(format!("condition {} not met", name))),
            Err(error) => Err(error),
        }
    }

    /// Returns the decoded value of a message: the cached one while it is
    /// younger than `max_age`, otherwise a fresh exchange on the bus.
    pub fn read(
        &self,
        circuit: Option<&str>,
        name: &str,
        max_age: Option<Duration>,
        fmt: OutputFormat,
        field: Option<&str>,
    ) -> Result<String> {
        let map = self.map();
        let message = map
            .get(circuit, name, false)
            .ok_or_else(|| Error::not_found(name.to_string()))?;
        self.check_condition(&map, &message)?;
        if message.direction().passive {
            // observed only; serve whatever was last seen
            return message.decode_last(fmt, field);
        }
        if let Some(max_age) = max_age {
            let fresh = message
                .age(Instant::now())
                .map(|age| age <= max_age)
                .unwrap_or(false);
            if fresh {
                debug!("{} {} served from cache", message.circuit(), message.name());
                return message.decode_last(fmt, field);
            }
        }
        self.fetch(&message)?;
        message.decode_last(fmt, field)
    }

    /// Encodes and sends a write message. Completes on the destination's
    /// ACK (or after a broadcast went out).
    pub fn write(&self, circuit: Option<&str>, name: &str, values: &str) -> Result<String> {
        let map = self.map();
        let message = map
            .get(circuit, name, true)
            .ok_or_else(|| Error::not_found(name.to_string()))?;
        self.check_condition(&map, &message)?;
        let master = message.prepare(self.own_address, values, 0)?;
        let reply = self.submit(master.clone(), Priority::Write)?;
        message.update_seen(&master, &reply, Instant::now());
        if message.telegram_kind() == Some(TelegramKind::MasterSlave) && !reply.is_empty() {
            debug!("write {} replied {}", message.name(), reply);
        }
        Ok("done".to_string())
    }

    /// Glob search over the catalog.
    pub fn find(
        &self,
        circuit_glob: &str,
        name_glob: &str,
        direction: Option<u8>,
    ) -> Vec<Arc<Message>> {
        self.map().find(circuit_glob, name_glob, direction)
    }

    /// Registers for passive updates matching the circuit/name globs.
    /// Updates arrive in the order they occurred.
    pub fn subscribe(&self, circuit_glob: &str, name_glob: &str) -> Receiver<UpdateNotice> {
        let (sink, receiver) = mpsc::channel();
        self.subscriptions.lock().unwrap().push(Subscription {
            circuit_glob: circuit_glob.to_string(),
            name_glob: name_glob.to_string(),
            sink,
        });
        receiver
    }

    /// Scans one slave address, or all of them, recording identities in
    /// the participant table.
    pub fn scan(&self, address: Option<u8>) -> Result<String> {
        match address {
            Some(address) => {
                if !symbol::is_slave(address) {
                    return Err(Error::invalid_arg(format!("address {:02x}", address)));
                }
                self.scan_one(address)?;
                Ok(self.scan_results())
            }
            None => {
                let mut found = 0;
                for address in scan_addresses(self.own_address) {
                    match self.scan_one(address) {
                        Ok(()) => found += 1,
                        Err(Error::DeviceTimeout) | Err(Error::SlaveNakReceived) => continue,
                        Err(error) => return Err(error),
                    }
                }
                debug!("scan finished, {} participants answered", found);
                Ok(self.scan_results())
            }
        }
    }

    fn scan_one(&self, address: u8) -> Result<()> {
        let mut master = scan_telegram(self.own_address, address)?;
        master.finish_payload()?;
        let reply = self.submit(master, Priority::Read)?;
        let ident = ScanIdent::parse(&reply)?;
        self.participants.lock().unwrap().set_ident(address, ident);
        Ok(())
    }

    /// The collected scan identities, one line per address.
    pub fn scan_results(&self) -> String {
        let participants = self.participants.lock().unwrap();
        let mut out = String::new();
        for (address, participant) in participants.iter() {
            if let Some(ident) = &participant.ident {
                out.push_str(&format!("{:02x}: {}\n", address, ident));
            }
        }
        out
    }

    /// Summary of the engine state for the `state` client command.
    pub fn state(&self) -> String {
        format!(
            "state: {:?}\nsignal: {}\nsymbols: {}\nqueue: {}\nmessages: {}\nparticipants: {}",
            self.status.state(),
            if self.status.generating_syn() {
                "generated"
            } else {
                "acquired"
            },
            self.status.symbols(),
            self.queue.len(),
            self.map().len(),
            self.participants.lock().unwrap().len(),
        )
    }

    /// Dump of the grabbed telegrams.
    pub fn grab_dump(&self, only_unknown: bool) -> String {
        self.grab.lock().unwrap().dump(only_unknown)
    }
}

/// Fans decoded updates out to the matching subscribers. Runs on its own
/// thread so the bus engine never calls front-end code.
fn notify_loop(events: Receiver<UpdateEvent>, subscriptions: Arc<Mutex<Vec<Subscription>>>) {
    while let Ok(event) = events.recv() {
        let UpdateEvent::Seen {
            message,
            master,
            slave,
            changed,
        } = event
        else {
            continue;
        };
        let value = message
            .decode(&master, &slave, OutputFormat::default(), None)
            .unwrap_or_default();
        let notice = UpdateNotice {
            circuit: message.circuit().to_string(),
            name: message.name().to_string(),
            value,
            changed,
        };
        let mut subscriptions = subscriptions.lock().unwrap();
        subscriptions.retain(|subscription| {
            if glob_match(&subscription.circuit_glob, &notice.circuit)
                && glob_match(&subscription.name_glob, &notice.name)
            {
                subscription.sink.send(notice.clone()).is_ok()
            } else {
                true
            }
        });
    }
}

/// The running engine: the bus thread, the notification task and the
/// dispatcher shared with front-ends.
pub struct Engine {
    pub dispatcher: Arc<Dispatcher>,
    stop: Arc<AtomicBool>,
    bus_thread: Option<JoinHandle<()>>,
    notifier: Option<JoinHandle<()>>,
}

impl Engine {
    /// Builds and starts the engine on the given transport and catalog.
    pub fn start<T: Transport + 'static>(
        transport: T,
        config: BusConfig,
        map: MessageMap,
    ) -> Engine {
        Engine::start_with_dump(transport, config, map, None)
    }

    /// As [`Engine::start`], additionally writing the received byte stream
    /// to a rolling dump file.
    pub fn start_with_dump<T: Transport + 'static>(
        transport: T,
        config: BusConfig,
        map: MessageMap,
        dump: Option<Dump>,
    ) -> Engine {
        let catalog = Arc::new(RwLock::new(Arc::new(map)));
        let queue = Arc::new(RequestQueue::new(32));
        let participants = Arc::new(Mutex::new(ParticipantTable::new()));
        let grab = Arc::new(Mutex::new(GrabStore::new()));
        let status = Arc::new(BusStatus::default());
        let stop = Arc::new(AtomicBool::new(false));
        let subscriptions: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));
        let (updates_tx, updates_rx) = mpsc::channel();

        let own_address = config.own_address;
        let mut handler = BusHandler::new(
            transport,
            config,
            catalog.clone(),
            queue.clone(),
            updates_tx,
            participants.clone(),
            grab.clone(),
            status.clone(),
            stop.clone(),
        );
        if let Some(dump) = dump {
            handler = handler.with_dump(dump);
        }
        let bus_thread = std::thread::Builder::new()
            .name("ebus-bus".to_string())
            .spawn(move || handler.run())
            .expect("spawn bus thread");
        let notify_subscriptions = subscriptions.clone();
        let notifier = std::thread::Builder::new()
            .name("ebus-notify".to_string())
            .spawn(move || notify_loop(updates_rx, notify_subscriptions))
            .expect("spawn notifier thread");

        Engine {
            dispatcher: Arc::new(Dispatcher {
                catalog,
                queue,
                own_address,
                request_timeout: REQUEST_TIMEOUT_DEFAULT,
                participants,
                grab,
                status,
                subscriptions,
            }),
            stop,
            bus_thread: Some(bus_thread),
            notifier: Some(notifier),
        }
    }

    /// Stops the bus thread and the notifier and waits for both.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(bus) = self.bus_thread.take() {
            let _ = bus.join();
        }
        // the updates channel closes with the bus thread
        if let Some(notifier) = self.notifier.take() {
            let _ = notifier.join();
        }
    }
}

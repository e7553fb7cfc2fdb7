//! Named request/response definitions and their catalog.

mod map;

pub use map::{Condition, ConditionValues, MessageMap};

use std::sync::Mutex;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::field::{Attributes, DataField, OutputFormat, PartType};
use crate::symbol::{self, SymbolString, TelegramKind};

/// How a message takes part in bus traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Direction {
    /// Observed only, never initiated by the engine.
    pub passive: bool,
    /// Data flows master to slave.
    pub write: bool,
}

impl Direction {
    pub const READ: Direction = Direction { passive: false, write: false };
    pub const WRITE: Direction = Direction { passive: false, write: true };
    pub const UPDATE: Direction = Direction { passive: true, write: false };
    pub const UPDATE_WRITE: Direction = Direction { passive: true, write: true };

    /// Parses the type column of a message row (`r`, `w`, `u`, `uw`, `mw`).
    pub fn parse(text: &str) -> Result<Direction> {
        match text.to_lowercase().as_str() {
            "r" => Ok(Direction::READ),
            "w" => Ok(Direction::WRITE),
            "u" => Ok(Direction::UPDATE),
            "uw" | "mw" => Ok(Direction::UPDATE_WRITE),
            other => Err(Error::invalid_arg(format!("message type {}", other))),
        }
    }

    /// Index component distinguishing read, write and passive entries with
    /// the same circuit and name.
    pub fn key_code(&self) -> u8 {
        match (self.passive, self.write) {
            (false, false) => 0,
            (false, true) => 1,
            (true, _) => 2,
        }
    }
}

/// Mutable last-seen state of a message, written by the bus thread and read
/// by clients under the per-message mutex.
#[derive(Debug, Default)]
pub struct MessageState {
    pub last_master: Option<SymbolString>,
    pub last_slave: Option<SymbolString>,
    pub last_update: Option<Instant>,
    pub last_change: Option<Instant>,
    pub last_poll: Option<Instant>,
    pub poll_count: u64,
}

/// A named request/response definition.
///
/// Identity on the wire is (source or wildcard, destination or wildcard,
/// PB/SB, identifier prefix); identity in the catalog is (circuit, name,
/// direction).
#[derive(Debug)]
pub struct Message {
    circuit: String,
    level: String,
    name: String,
    direction: Direction,
    attributes: Attributes,
    /// Fixed source address, `None` for any master.
    src: Option<u8>,
    /// Destination address, `None` for a wildcard (passive only).
    dst: Option<u8>,
    /// PB, SB and identifier bytes; one entry per chained chunk.
    ids: Vec<Vec<u8>>,
    fields: DataField,
    condition: Option<String>,
    poll_priority: u8,
    state: Mutex<MessageState>,
}

impl Message {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        circuit: String,
        level: String,
        name: String,
        direction: Direction,
        attributes: Attributes,
        src: Option<u8>,
        dst: Option<u8>,
        ids: Vec<Vec<u8>>,
        fields: DataField,
        condition: Option<String>,
        poll_priority: u8,
    ) -> Result<Message> {
        if ids.is_empty() || ids[0].len() < 2 {
            return Err(Error::invalid_arg("message without PBSB"));
        }
        if ids.iter().any(|id| id.len() > 2 + 6) {
            return Err(Error::invalid_arg("identifier too long"));
        }
        if circuit.is_empty() || name.is_empty() {
            return Err(Error::invalid_arg("message without circuit or name"));
        }
        if dst.is_none() && !direction.passive {
            return Err(Error::invalid_arg("active message without destination"));
        }
        if let Some(dst) = dst {
            if !symbol::is_valid_address(dst, true) {
                return Err(Error::invalid_arg("invalid destination"));
            }
        }
        Ok(Message {
            circuit,
            level,
            name,
            direction,
            attributes,
            src,
            dst,
            ids,
            fields,
            condition,
            poll_priority,
            state: Mutex::new(MessageState::default()),
        })
    }

    pub fn circuit(&self) -> &str {
        &self.circuit
    }

    pub fn level(&self) -> &str {
        &self.level
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn condition(&self) -> Option<&str> {
        self.condition.as_deref()
    }

    pub fn poll_priority(&self) -> u8 {
        self.poll_priority
    }

    pub fn is_pollable(&self) -> bool {
        self.poll_priority > 0 && !self.direction.passive && !self.direction.write
    }

    pub fn destination(&self) -> Option<u8> {
        self.dst
    }

    /// Primary PB/SB and identifier bytes.
    pub fn id(&self) -> &[u8] {
        &self.ids[0]
    }

    pub fn source(&self) -> Option<u8> {
        self.src
    }

    /// Identifier tails (after PBSB) of all chain chunks as hex strings.
    pub fn ids_tails(&self) -> Vec<String> {
        self.ids
            .iter()
            .map(|id| crate::util::to_hex(&id[2..]))
            .collect()
    }

    /// Number of chained round-trips (1 for plain messages).
    pub fn chain_len(&self) -> usize {
        self.ids.len()
    }

    pub fn fields(&self) -> &DataField {
        &self.fields
    }

    /// The telegram kind this message produces when sent.
    pub fn telegram_kind(&self) -> Option<TelegramKind> {
        self.dst.map(TelegramKind::of)
    }

    /// Composes the concrete master telegram for one chain chunk: source,
    /// destination, PB, SB, NN, identifier tail, encoded request fields.
    /// The CRC stays inside the returned string's running checksum.
    pub fn prepare(&self, source: u8, values: &str, chunk: usize) -> Result<SymbolString> {
        if !symbol::is_master(source) {
            return Err(Error::invalid_arg("source is not a master address"));
        }
        let dst = self
            .dst
            .ok_or_else(|| Error::invalid_arg("message without destination"))?;
        let id = self.ids.get(chunk).ok_or(Error::InvalidPos)?;
        let mut master = SymbolString::master();
        master.push(source)?;
        master.push(dst)?;
        master.push(id[0])?;
        master.push(id[1])?;
        master.push(0)?; // NN, patched below
        for &byte in &id[2..] {
            master.push(byte)?;
        }
        let mut payload = Vec::new();
        self.fields.write(PartType::MasterData, values, &mut payload)?;
        for byte in payload {
            master.push(byte)?;
        }
        master.finish_payload()?;
        Ok(master)
    }

    /// Decodes a completed exchange into the shared textual representation.
    pub fn decode(
        &self,
        master: &SymbolString,
        slave: &SymbolString,
        fmt: OutputFormat,
        field_filter: Option<&str>,
    ) -> Result<String> {
        let id_tail = self.ids[0].len() - 2;
        self.fields.read(master, id_tail, slave, fmt, field_filter)
    }

    /// Whether a received master telegram matches this message's identity.
    /// Returns the matching chain chunk.
    pub fn matches(&self, master: &SymbolString) -> Option<usize> {
        let src = master.source()?;
        let dst = master.destination()?;
        if let Some(want) = self.src {
            if want != src {
                return None;
            }
        }
        if let Some(want) = self.dst {
            if want != dst {
                return None;
            }
        }
        let pb = master.pb()?;
        let sb = master.sb()?;
        let payload = master.payload();
        'chunk: for (index, id) in self.ids.iter().enumerate() {
            if id[0] != pb || id[1] != sb {
                continue;
            }
            let tail = &id[2..];
            if payload.len() < tail.len() {
                continue;
            }
            for (have, want) in payload.iter().zip(tail.iter()) {
                if have != want {
                    continue 'chunk;
                }
            }
            return Some(index);
        }
        None
    }

    /// Stores a passively observed or actively fetched exchange. Bumps the
    /// change stamp only when the bytes differ from the previous ones.
    pub fn update_seen(
        &self,
        master: &SymbolString,
        slave: &SymbolString,
        now: Instant,
    ) -> bool {
        let mut state = self.state.lock().unwrap();
        let changed = state.last_master.as_ref() != Some(master)
            || state.last_slave.as_ref() != Some(slave);
        state.last_master = Some(master.clone());
        state.last_slave = Some(slave.clone());
        state.last_update = Some(now);
        if changed {
            state.last_change = Some(now);
        }
        changed
    }

    /// Runs `f` on the current state under the per-message mutex.
    pub fn with_state<T>(&self, f: impl FnOnce(&MessageState) -> T) -> T {
        f(&self.state.lock().unwrap())
    }

    /// Age of the cached value, if any.
    pub fn age(&self, now: Instant) -> Option<std::time::Duration> {
        self.state
            .lock()
            .unwrap()
            .last_update
            .map(|at| now.saturating_duration_since(at))
    }

    /// Decodes the cached last exchange, if any.
    pub fn decode_last(&self, fmt: OutputFormat, field_filter: Option<&str>) -> Result<String> {
        let state = self.state.lock().unwrap();
        match (&state.last_master, &state.last_slave) {
            (Some(master), Some(slave)) => self.decode(master, slave, fmt, field_filter),
            _ => Err(Error::not_found(format!("{} {}", self.circuit, self.name))),
        }
    }

    pub fn mark_polled(&self, now: Instant) {
        let mut state = self.state.lock().unwrap();
        state.last_poll = Some(now);
        state.poll_count += 1;
    }

    pub(crate) fn poll_score(&self, now: Instant, created: Instant) -> u128 {
        let state = self.state.lock().unwrap();
        let since = state.last_poll.unwrap_or(created);
        now.saturating_duration_since(since).as_millis() * self.poll_priority as u128
    }
}

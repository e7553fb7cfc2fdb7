use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use super::Message;
use crate::error::{Error, Result};
use crate::field::OutputFormat;
use crate::symbol::SymbolString;
use crate::util::glob_match;

/// Accepted values of a [`Condition`]: any cached value, a set of labels,
/// or numeric ranges.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionValues {
    Any,
    Strings(Vec<String>),
    Ranges(Vec<(i64, i64)>),
}

impl ConditionValues {
    /// Parses the values column: empty, `label;label`, or `n`/`n-m` sets.
    pub fn parse(text: &str) -> ConditionValues {
        let text = text.trim();
        if text.is_empty() {
            return ConditionValues::Any;
        }
        let mut ranges = Vec::new();
        let mut strings = Vec::new();
        for entry in text.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if let Some((low, high)) = entry.split_once('-').and_then(|(a, b)| {
                Some((a.trim().parse::<i64>().ok()?, b.trim().parse::<i64>().ok()?))
            }) {
                ranges.push((low, high));
            } else if let Ok(single) = entry.parse::<i64>() {
                ranges.push((single, single));
            } else {
                strings.push(entry.to_string());
            }
        }
        if !strings.is_empty() {
            // mixed sets compare textually
            for (low, high) in ranges {
                if low == high {
                    strings.push(low.to_string());
                }
            }
            ConditionValues::Strings(strings)
        } else if !ranges.is_empty() {
            ConditionValues::Ranges(ranges)
        } else {
            ConditionValues::Any
        }
    }
}

/// A named gate referencing another message's cached field value.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub name: String,
    pub circuit: String,
    pub message: String,
    pub field: Option<String>,
    pub dst: Option<u8>,
    pub values: ConditionValues,
}

impl Condition {
    /// Evaluates against the cached value of the referenced message.
    /// `NotFound` means no value has been seen yet; the dispatcher then
    /// refreshes the reference and retries.
    pub fn evaluate(&self, map: &MessageMap) -> Result<bool> {
        let message = map
            .get(Some(self.circuit.as_str()), &self.message, false)
            .ok_or_else(|| Error::not_found(format!("{} {}", self.circuit, self.message)))?;
        let text = message.decode_last(OutputFormat::default(), self.field.as_deref())?;
        match &self.values {
            ConditionValues::Any => Ok(true),
            ConditionValues::Strings(list) => Ok(list.iter().any(|v| v == &text)),
            ConditionValues::Ranges(list) => {
                let number: f64 = text
                    .parse()
                    .map_err(|_| Error::invalid_arg(format!("condition value {}", text)))?;
                Ok(list
                    .iter()
                    .any(|&(low, high)| number >= low as f64 && number <= high as f64))
            }
        }
    }

    /// The message this condition consults.
    pub fn reference(&self) -> (&str, &str) {
        (&self.circuit, &self.message)
    }
}

/// The message catalog: an arena of messages with index maps for client
/// lookup and passive wire matching, plus the poll queue and conditions.
/// Immutable once loaded; a reload builds a fresh map and swaps the `Arc`.
#[derive(Debug)]
pub struct MessageMap {
    messages: Vec<Arc<Message>>,
    by_key: HashMap<(String, String, u8), usize>,
    by_pbsb: HashMap<u16, Vec<usize>>,
    conditions: HashMap<String, Condition>,
    created: Instant,
}

impl Default for MessageMap {
    fn default() -> Self {
        MessageMap::new()
    }
}

impl MessageMap {
    pub fn new() -> MessageMap {
        MessageMap {
            messages: Vec::new(),
            by_key: HashMap::new(),
            by_pbsb: HashMap::new(),
            conditions: HashMap::new(),
            created: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Message>> {
        self.messages.iter()
    }

    /// Adds a message, rejecting a duplicate (circuit, name, direction).
    /// Conditional variants of the same identity may coexist.
    pub fn add(&mut self, message: Message) -> Result<()> {
        let key = (
            message.circuit().to_lowercase(),
            message.name().to_lowercase(),
            message.direction().key_code(),
        );
        if message.condition().is_none() && self.by_key.contains_key(&key) {
            return Err(Error::DuplicateName(format!(
                "{} {}",
                message.circuit(),
                message.name()
            )));
        }
        let index = self.messages.len();
        let pbsb = (message.id()[0] as u16) << 8 | message.id()[1] as u16;
        self.messages.push(Arc::new(message));
        self.by_key.entry(key).or_insert(index);
        self.by_pbsb.entry(pbsb).or_default().push(index);
        Ok(())
    }

    pub fn add_condition(&mut self, condition: Condition) -> Result<()> {
        let key = condition.name.to_lowercase();
        if self.conditions.contains_key(&key) {
            return Err(Error::DuplicateName(condition.name));
        }
        self.conditions.insert(key, condition);
        Ok(())
    }

    pub fn condition(&self, name: &str) -> Option<&Condition> {
        self.conditions.get(&name.to_lowercase())
    }

    /// Client lookup by circuit and name. An empty circuit searches all
    /// circuits. Write lookups fall back to nothing; read lookups fall back
    /// to passive entries so cached updates stay readable.
    pub fn get(&self, circuit: Option<&str>, name: &str, write: bool) -> Option<Arc<Message>> {
        let name = name.to_lowercase();
        let codes: &[u8] = if write { &[1] } else { &[0, 2] };
        match circuit {
            Some(circuit) if !circuit.is_empty() => {
                let circuit = circuit.to_lowercase();
                codes.iter().find_map(|&code| {
                    self.by_key
                        .get(&(circuit.clone(), name.clone(), code))
                        .map(|&i| self.messages[i].clone())
                })
            }
            _ => codes.iter().find_map(|&code| {
                self.messages
                    .iter()
                    .find(|m| {
                        m.name().to_lowercase() == name && m.direction().key_code() == code
                    })
                    .cloned()
            }),
        }
    }

    /// Glob search over circuit and name, optionally restricted to one
    /// direction class (0 read, 1 write, 2 passive).
    pub fn find(
        &self,
        circuit_glob: &str,
        name_glob: &str,
        direction: Option<u8>,
    ) -> Vec<Arc<Message>> {
        let circuit_glob = if circuit_glob.is_empty() { "*" } else { circuit_glob };
        let name_glob = if name_glob.is_empty() { "*" } else { name_glob };
        self.messages
            .iter()
            .filter(|m| {
                direction.map_or(true, |d| m.direction().key_code() == d)
                    && glob_match(circuit_glob, m.circuit())
                    && glob_match(name_glob, m.name())
            })
            .cloned()
            .collect()
    }

    /// Wire lookup for passive reception: the message whose identity
    /// matches the received master telegram, preferring the longest
    /// identifier prefix. Returns the matched chain chunk as well.
    pub fn find_for_master(&self, master: &SymbolString) -> Option<(Arc<Message>, usize)> {
        let pbsb = ((master.pb()? as u16) << 8) | master.sb()? as u16;
        let mut best: Option<(Arc<Message>, usize, usize)> = None;
        for &index in self.by_pbsb.get(&pbsb)? {
            let message = &self.messages[index];
            if let Some(chunk) = message.matches(master) {
                let id_len = message.id().len();
                if best.as_ref().map_or(true, |(_, _, len)| id_len > *len) {
                    best = Some((message.clone(), chunk, id_len));
                }
            }
        }
        best.map(|(message, chunk, _)| (message, chunk))
    }

    /// The next poll target: the pollable message with the highest
    /// staleness-weighted score, ties broken by declaration order.
    pub fn next_poll(&self, now: Instant) -> Option<Arc<Message>> {
        let mut best: Option<(&Arc<Message>, u128)> = None;
        for message in self.messages.iter().filter(|m| m.is_pollable()) {
            let score = message.poll_score(now, self.created);
            let better = match best {
                None => true,
                Some((_, best_score)) => score > best_score,
            };
            if better {
                best = Some((message, score));
            }
        }
        best.map(|(message, _)| message.clone())
    }
}

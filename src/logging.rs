//! Per-area log levels on top of the `log` facade. Each facility carries
//! an atomic level so the `log level` client command can retune verbosity
//! at runtime without touching the global filter.

use std::sync::atomic::{AtomicU8, Ordering};

use log::{Level, LevelFilter};

use crate::error::{Error, Result};

/// Log facilities of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Area {
    Main = 0,
    Bus = 1,
    Update = 2,
    Network = 3,
    Other = 4,
}

pub const AREAS: [Area; 5] = [Area::Main, Area::Bus, Area::Update, Area::Network, Area::Other];

impl Area {
    pub fn name(&self) -> &'static str {
        match self {
            Area::Main => "main",
            Area::Bus => "bus",
            Area::Update => "update",
            Area::Network => "network",
            Area::Other => "other",
        }
    }

    pub fn parse(text: &str) -> Result<Area> {
        match text.to_lowercase().as_str() {
            "main" => Ok(Area::Main),
            "bus" => Ok(Area::Bus),
            "update" => Ok(Area::Update),
            "network" => Ok(Area::Network),
            "other" => Ok(Area::Other),
            other => Err(Error::invalid_arg(format!("log area {}", other))),
        }
    }
}

fn filter_to_u8(filter: LevelFilter) -> u8 {
    match filter {
        LevelFilter::Off => 0,
        LevelFilter::Error => 1,
        LevelFilter::Warn => 2,
        LevelFilter::Info => 3,
        LevelFilter::Debug => 4,
        LevelFilter::Trace => 5,
    }
}

fn u8_to_filter(value: u8) -> LevelFilter {
    match value {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

pub fn parse_level(text: &str) -> Result<LevelFilter> {
    match text.to_lowercase().as_str() {
        "off" | "none" => Ok(LevelFilter::Off),
        "error" => Ok(LevelFilter::Error),
        "warn" | "notice" => Ok(LevelFilter::Warn),
        "info" => Ok(LevelFilter::Info),
        "debug" => Ok(LevelFilter::Debug),
        "trace" => Ok(LevelFilter::Trace),
        other => Err(Error::invalid_arg(format!("log level {}", other))),
    }
}

static LEVELS: [AtomicU8; 5] = [
    AtomicU8::new(3),
    AtomicU8::new(3),
    AtomicU8::new(3),
    AtomicU8::new(3),
    AtomicU8::new(3),
];

pub fn set_level(area: Area, filter: LevelFilter) {
    LEVELS[area as usize].store(filter_to_u8(filter), Ordering::Relaxed);
}

pub fn set_all(filter: LevelFilter) {
    for area in AREAS {
        set_level(area, filter);
    }
}

pub fn level(area: Area) -> LevelFilter {
    u8_to_filter(LEVELS[area as usize].load(Ordering::Relaxed))
}

/// Gate consulted before emitting through the `log` macros on hot paths.
pub fn enabled(area: Area, level: Level) -> bool {
    level <= u8_to_filter(LEVELS[area as usize].load(Ordering::Relaxed))
}

/// Summary of all facility levels for the `log` client command.
pub fn describe() -> String {
    AREAS
        .iter()
        .map(|area| format!("{}: {}", area.name(), level(*area)))
        .collect::<Vec<_>>()
        .join("\n")
}

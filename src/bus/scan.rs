use std::collections::BTreeMap;

use num_enum::FromPrimitive;

use crate::error::{Error, Result};
use crate::symbol::{self, SymbolString};

/// Identification request PB/SB.
pub const SCAN_PBSB: [u8; 2] = [0x07, 0x04];
/// Length of the identification reply payload.
pub const SCAN_IDENT_LEN: usize = 10;

/// Known manufacturer codes of the identification reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Manufacturer {
    Dungs = 0x06,
    Tem = 0x10,
    Lamberti = 0x11,
    Ceb = 0x14,
    LandisStaefa = 0x15,
    Ferro = 0x16,
    Mondial = 0x17,
    Wikon = 0x18,
    Wolf = 0x19,
    Rawe = 0x20,
    Satronic = 0x30,
    Encon = 0x40,
    Kromschroeder = 0x50,
    Eberle = 0x60,
    Ebv = 0x65,
    Graesslin = 0x75,
    EbmPapst = 0x85,
    Sig = 0x95,
    Theben = 0xA5,
    Thermowatt = 0xA7,
    Vaillant = 0xB5,
    Toby = 0xC0,
    Weishaupt = 0xC5,
    #[num_enum(default)]
    Unknown = 0x00,
}

impl Manufacturer {
    pub fn name(&self) -> &'static str {
        match self {
            Manufacturer::Dungs => "Dungs",
            Manufacturer::Tem => "TEM",
            Manufacturer::Lamberti => "Lamberti",
            Manufacturer::Ceb => "CEB",
            Manufacturer::LandisStaefa => "Landis-Staefa",
            Manufacturer::Ferro => "FERRO",
            Manufacturer::Mondial => "MONDIAL",
            Manufacturer::Wikon => "Wikon",
            Manufacturer::Wolf => "Wolf",
            Manufacturer::Rawe => "RAWE",
            Manufacturer::Satronic => "Satronic",
            Manufacturer::Encon => "ENCON",
            Manufacturer::Kromschroeder => "Kromschröder",
            Manufacturer::Eberle => "Eberle",
            Manufacturer::Ebv => "EBV",
            Manufacturer::Graesslin => "Grässlin",
            Manufacturer::EbmPapst => "ebm-papst",
            Manufacturer::Sig => "SIG",
            Manufacturer::Theben => "Theben",
            Manufacturer::Thermowatt => "Thermowatt",
            Manufacturer::Vaillant => "Vaillant",
            Manufacturer::Toby => "Toby",
            Manufacturer::Weishaupt => "Weishaupt",
            Manufacturer::Unknown => "unknown",
        }
    }
}

/// Decoded identification reply of one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanIdent {
    pub manufacturer: Manufacturer,
    pub manufacturer_code: u8,
    /// Five character unit id.
    pub unit: String,
    /// Software revision digits.
    pub software: String,
    /// Hardware revision digits.
    pub hardware: String,
}

impl ScanIdent {
    /// Parses the ten byte identification payload
    /// (manufacturer, unit id, software and hardware revision).
    pub fn parse(slave: &SymbolString) -> Result<ScanIdent> {
        let payload = slave.payload();
        if payload.len() < SCAN_IDENT_LEN {
            return Err(Error::InvalidPos);
        }
        let manufacturer_code = payload[0];
        let unit: String = payload[1..6]
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
            .collect();
        Ok(ScanIdent {
            manufacturer: Manufacturer::from(manufacturer_code),
            manufacturer_code,
            unit,
            software: format!("{:02x}{:02x}", payload[6], payload[7]),
            hardware: format!("{:02x}{:02x}", payload[8], payload[9]),
        })
    }
}

impl std::fmt::Display for ScanIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{};{};SW={};HW={}",
            self.manufacturer.name(),
            self.unit,
            self.software,
            self.hardware
        )
    }
}

/// Per-address bookkeeping of everything seen on the bus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Participant {
    pub seen_as_master: bool,
    pub seen_as_slave: bool,
    pub ident: Option<ScanIdent>,
}

/// The table of observed participants, keyed by address.
#[derive(Debug, Default)]
pub struct ParticipantTable {
    by_address: BTreeMap<u8, Participant>,
}

impl ParticipantTable {
    pub fn new() -> ParticipantTable {
        ParticipantTable::default()
    }

    pub fn saw_master(&mut self, address: u8) {
        if symbol::is_master(address) {
            self.by_address.entry(address).or_default().seen_as_master = true;
        }
    }

    pub fn saw_slave(&mut self, address: u8) {
        if symbol::is_slave(address) {
            self.by_address.entry(address).or_default().seen_as_slave = true;
        }
    }

    pub fn set_ident(&mut self, address: u8, ident: ScanIdent) {
        let entry = self.by_address.entry(address).or_default();
        entry.seen_as_slave = true;
        entry.ident = Some(ident);
    }

    pub fn get(&self, address: u8) -> Option<&Participant> {
        self.by_address.get(&address)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &Participant)> {
        self.by_address.iter().map(|(&a, p)| (a, p))
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::Part;

    #[test]
    fn parses_identification_reply() {
        // Vaillant "BAI00" SW 01.08 HW 60.04
        let slave =
            SymbolString::parse_hex(Part::Slave, "0ab5424149303001086004", false).unwrap();
        let ident = ScanIdent::parse(&slave).unwrap();
        assert_eq!(ident.manufacturer, Manufacturer::Vaillant);
        assert_eq!(ident.unit, "BAI00");
        assert_eq!(ident.software, "0108");
        assert_eq!(ident.hardware, "6004");
        assert_eq!(ident.to_string(), "Vaillant;BAI00;SW=0108;HW=6004");
    }

    #[test]
    fn short_reply_rejected() {
        let slave = SymbolString::parse_hex(Part::Slave, "03b54241", false).unwrap();
        assert_eq!(ScanIdent::parse(&slave), Err(Error::InvalidPos));
    }

    #[test]
    fn table_tracks_roles() {
        let mut table = ParticipantTable::new();
        table.saw_master(0xFF);
        table.saw_slave(0x08);
        // SYN is never an address
        table.saw_slave(0xAA);
        assert_eq!(table.len(), 2);
        assert!(table.get(0xFF).unwrap().seen_as_master);
        assert!(table.get(0x08).unwrap().seen_as_slave);
    }
}

//! The protocol engine: arbitration and send/receive state machine,
//! request queue, participant scan bookkeeping and the raw dump.

mod dump;
mod grab;
mod handler;
mod request;
mod scan;
mod transport;

pub use dump::Dump;
pub use grab::{GrabEntry, GrabStore};
pub use handler::{BusConfig, BusHandler, BusState, BusStatus, UpdateEvent};
pub use request::{BusRequest, Priority, RequestHandle, RequestQueue};
pub use scan::{Manufacturer, Participant, ParticipantTable, ScanIdent, SCAN_IDENT_LEN, SCAN_PBSB};
pub use transport::Transport;

use crate::symbol::{self, SymbolString};
use crate::error::Result;

/// Builds the identification request telegram for one slave address.
pub fn scan_telegram(own_address: u8, destination: u8) -> Result<SymbolString> {
    let mut master = SymbolString::master();
    master.push(own_address)?;
    master.push(destination)?;
    master.push(SCAN_PBSB[0])?;
    master.push(SCAN_PBSB[1])?;
    master.push(0x00)?;
    Ok(master)
}

/// All addresses worth scanning: the slave addresses excluding our own.
pub fn scan_addresses(own_address: u8) -> impl Iterator<Item = u8> {
    let own_slave = symbol::slave_of(own_address);
    (0u16..=255)
        .map(|a| a as u8)
        .filter(move |&a| symbol::is_slave(a) && a != own_slave)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_telegram_shape() {
        let master = scan_telegram(0xFF, 0x08).unwrap();
        assert_eq!(&master[..], &[0xFF, 0x08, 0x07, 0x04, 0x00]);
        assert!(master.complete());
    }

    #[test]
    fn scan_addresses_skip_masters_and_self() {
        let addresses: Vec<u8> = scan_addresses(0xFF).collect();
        assert!(!addresses.contains(&0xFF));
        assert!(!addresses.contains(&0x04)); // own slave address
        assert!(!addresses.contains(&0x10)); // a master
        assert!(!addresses.contains(&0xAA)); // SYN
        assert!(addresses.contains(&0x08));
    }
}

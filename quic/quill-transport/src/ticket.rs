// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The client's in-memory session-ticket store.
//!
//! Tickets are keyed by (SNI, ALPN); a fresh ticket for the same key
//! replaces the old one. Persistence to disk is out of scope, the host
//! may drain and reload the store around process restarts.

use quill_core::time::Timestamp;

#[derive(Clone, Debug)]
pub struct StoredTicket {
    pub sni: String,
    pub alpn: String,
    pub ticket: Vec<u8>,
    pub time_valid_until: Timestamp,
}

impl StoredTicket {
    /// The PSK cipher-suite id stored at offset 8 of the ticket blob
    pub fn cipher_suite_id(&self) -> Option<u16> {
        let bytes = self.ticket.get(8..10)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

#[derive(Debug, Default)]
pub struct TicketStore {
    tickets: Vec<StoredTicket>,
}

impl TicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a ticket, replacing any previous one for the same
    /// (SNI, ALPN) pair
    pub fn store(
        &mut self,
        sni: &str,
        alpn: &str,
        ticket: Vec<u8>,
        time_valid_until: Timestamp,
    ) {
        self.tickets
            .retain(|stored| !(stored.sni == sni && stored.alpn == alpn));
        self.tickets.push(StoredTicket {
            sni: sni.to_string(),
            alpn: alpn.to_string(),
            ticket,
            time_valid_until,
        });
    }

    /// Finds a still-valid ticket for (SNI, ALPN), dropping expired ones
    /// along the way
    pub fn get(&mut self, sni: &str, alpn: &str, now: Timestamp) -> Option<&StoredTicket> {
        self.tickets.retain(|stored| stored.time_valid_until > now);
        self.tickets
            .iter()
            .find(|stored| stored.sni == sni && stored.alpn == alpn)
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_lookup_test() {
        let mut store = TicketStore::new();
        let expiry = Timestamp::from_micros(100);
        store.store("a.example.com", "hq-08", vec![1, 2, 3], expiry);
        store.store("b.example.com", "hq-08", vec![4], expiry);

        let now = Timestamp::from_micros(10);
        assert_eq!(
            store.get("a.example.com", "hq-08", now).unwrap().ticket,
            vec![1, 2, 3]
        );
        assert!(store.get("a.example.com", "h3", now).is_none());
    }

    #[test]
    fn replacement_test() {
        let mut store = TicketStore::new();
        let expiry = Timestamp::from_micros(100);
        store.store("a.example.com", "hq-08", vec![1], expiry);
        store.store("a.example.com", "hq-08", vec![2], expiry);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store
                .get("a.example.com", "hq-08", Timestamp::from_micros(0))
                .unwrap()
                .ticket,
            vec![2]
        );
    }

    #[test]
    fn expiry_test() {
        let mut store = TicketStore::new();
        store.store("a.example.com", "hq-08", vec![1], Timestamp::from_micros(50));
        assert!(store
            .get("a.example.com", "hq-08", Timestamp::from_micros(60))
            .is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn cipher_suite_test() {
        let mut blob = vec![0u8; 8];
        blob.extend_from_slice(&0x1301u16.to_be_bytes());
        let ticket = StoredTicket {
            sni: String::new(),
            alpn: String::new(),
            ticket: blob,
            time_valid_until: Timestamp::from_micros(0),
        };
        assert_eq!(ticket.cipher_suite_id(), Some(0x1301));
    }
}

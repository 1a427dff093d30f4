//! Seat status and peer routes

use std::collections::{BTreeSet, HashMap};

use crate::protocol::events::NewPeer;
use crate::protocol::ClientType;

/// Routing state for one seat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeatStatus {
    pub enabled: bool,
    pub client_type: ClientType,
}

/// Where a peer's traffic goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRoute {
    pub seat: u32,
    pub client_type: ClientType,
}

/// Seat and route tables. Always accessed under the router's single lock.
#[derive(Debug, Default)]
pub struct SeatTable {
    seats: HashMap<u32, SeatStatus>,
    routes: HashMap<String, PeerRoute>,
    /// Enabled state for seats not yet in the table, flipped by global toggles
    routing_enabled: bool,
}

impl SeatTable {
    /// Record a peer. Returns the route it replaced, if any.
    pub fn add_peer(&mut self, peer: &NewPeer) -> Option<PeerRoute> {
        let default_enabled = self.routing_enabled;
        let status = self.seats.entry(peer.seat).or_insert(SeatStatus {
            enabled: default_enabled,
            client_type: peer.client_type,
        });
        status.client_type = peer.client_type;

        self.routes.insert(
            peer.id.clone(),
            PeerRoute {
                seat: peer.seat,
                client_type: peer.client_type,
            },
        )
    }

    pub fn remove_peer(&mut self, id: &str) -> Option<PeerRoute> {
        self.routes.remove(id)
    }

    pub fn peer(&self, id: &str) -> Option<&PeerRoute> {
        self.routes.get(id)
    }

    pub fn status(&self, seat: u32) -> Option<SeatStatus> {
        self.seats.get(&seat).copied()
    }

    pub fn is_enabled(&self, seat: u32) -> bool {
        self.seats
            .get(&seat)
            .map(|s| s.enabled)
            .unwrap_or(self.routing_enabled)
    }

    /// Make sure `seat` has a status entry so global toggles and shutdown reach it
    pub fn touch(&mut self, seat: u32) {
        let enabled = self.routing_enabled;
        self.seats.entry(seat).or_insert(SeatStatus {
            enabled,
            client_type: ClientType::Player,
        });
    }

    /// Enable or disable one seat, or every seat when `seat` is `None`.
    /// Returns the seats affected.
    pub fn set_enabled(&mut self, seat: Option<u32>, enabled: bool) -> Vec<u32> {
        match seat {
            Some(seat) => {
                self.touch(seat);
                if let Some(status) = self.seats.get_mut(&seat) {
                    status.enabled = enabled;
                }
                vec![seat]
            }
            None => {
                self.routing_enabled = enabled;
                for status in self.seats.values_mut() {
                    status.enabled = enabled;
                }
                self.known_seats()
            }
        }
    }

    pub fn known_seats(&self) -> Vec<u32> {
        let mut seats: BTreeSet<u32> = self.seats.keys().copied().collect();
        seats.extend(self.routes.values().map(|r| r.seat));
        seats.into_iter().collect()
    }
}

//! Datalink layers.
//!
//! Currently BACnet/SC (Annex AB) only; the module layout leaves room for
//! the classic IP and MS/TP datalinks.

pub mod bsc;

//! Command layer of ebakup: the backup driver, the cross-storage sync
//! engine, the verification driver and the shadow-tree materializer. All
//! storage semantics live in `ebakup_datastore`; this crate only feeds and
//! drives the engine.

pub mod backup;
pub mod shadow;
pub mod sync;
pub mod verify;

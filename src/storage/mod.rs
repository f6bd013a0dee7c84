//! Local storage for the gateway.
//!
//! The traits define the abstract interface; [`memory`] and [`persistent`]
//! provide the two backends.

pub mod memory;
pub mod persistent;
mod traits;

pub use memory::{InMemoryCommandLedger, InMemoryCredentialStore, InMemoryStores};
pub use persistent::{open_database, PersistentConfig, PersistentStores};
pub use traits::{CommandLedger, CredentialStore, CredentialView, StoreError};

//! Owner/replica synchronization.
//!
//! The owner fans every content change out through a [`ChangeHub`] and
//! answers replica requests through a [`SyncHost`]. Replicas reach the owner
//! through an [`OwnerLink`]: [`LocalLink`] in the same process or
//! [`SocketLink`] over a Unix socket served by [`SocketServer`].

mod host;
mod hub;
mod link;
mod replica;
mod socket;

pub use host::SyncHost;
pub use hub::{ChangeHub, PushSender};
pub use link::{LocalLink, OwnerLink};
pub use replica::SettingsReplica;
pub use socket::{SocketLink, SocketServer};

//! Distribution layer for a clustered IRC daemon: the sharded realm, the
//! shared-state store, the pub/sub bus, and credential resolution. The IRC
//! wire protocol, TCP listener, and process supervision are external
//! collaborators; see [`protocol_adapter`] for the seam between them and
//! this crate.

pub mod bus;
pub mod config;
pub mod credentials;
pub mod error;
pub mod message;
pub mod protocol_adapter;
pub mod realm;
pub mod shared_group;
pub mod shared_user;
pub mod store;
pub mod telemetry;
pub mod validation;

pub use error::{CoreError, CoreResult};
pub use realm::Realm;
pub use shared_group::SharedGroup;
pub use shared_user::SharedUser;

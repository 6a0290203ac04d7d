//! Card register decoders: CSD, SCR, CID, and EXT_CSD.
//!
//! Each submodule is a pure decode of one register's raw wire bytes into a
//! typed struct; none of them talk to a [`crate::host_adapter::HostAdapter`].

pub mod cid;
pub mod csd;
pub mod ext_csd;
pub mod scr;

pub use cid::Cid;
pub use csd::Csd;
pub use ext_csd::ExtCsdPartitions;
pub use scr::Scr;

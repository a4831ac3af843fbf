pub mod codeview;
pub mod coff;
pub mod cursor;
pub mod error;
pub mod image;
mod int_from_byte_slice;
pub mod locator;
pub mod module;
pub mod nt4dbg;
pub mod omap;
pub mod pdb;
pub mod pe;
pub mod sink;


#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::Error;


/// The outcome of trying to load debug information from one source.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum LoadStatus {
    Loaded,
    NoInfo,
    Error,
}
impl LoadStatus {
    /// Collapses the result of a load pass, logging what went wrong.
    pub(crate) fn from_result(result: Result<(), Error>, module_name: &str) -> Self {
        match result {
            Ok(()) => Self::Loaded,
            Err(Error::NotFound { name }) => {
                info!("no debug information for {}: {:?} not found", module_name, name);
                Self::NoInfo
            },
            Err(e) => {
                error!("failed to load debug information for {}: {}", module_name, e);
                Self::Error
            },
        }
    }
}

pub mod change;
pub mod error;
pub mod keys;
pub mod lite;
pub mod protocol;
pub mod subscription;
pub mod version;

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

pub use error::ErrorKind;
pub use keys::{RowId, RowKey};
pub use version::{CvrVersion, Lsn, StateVersion};

mod chains;
mod conflict_resolver;
mod ops;

pub use chains::*;
pub use conflict_resolver::*;
pub use ops::*;

#[macro_use]
extern crate log;

mod codec;
mod node_store;
mod peers;
mod recovery;

#[cfg(test)]
mod test_recovery;

pub use codec::*;
pub use node_store::*;
pub use peers::*;
pub use recovery::*;

#[macro_use]
extern crate log;

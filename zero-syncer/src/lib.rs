pub mod backfill;
pub mod change_source;
pub mod drain;
pub mod multiplexer;
pub mod pusher;
pub mod replicator;
pub mod services;
pub mod view;

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

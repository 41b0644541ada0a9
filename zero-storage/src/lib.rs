pub mod cdc;
pub mod cvr;
pub mod postgres;
pub mod replica;
pub mod txpool;

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

#![no_std]

// Use std when running tests, see: https://stackoverflow.com/a/28186509
// Make sure to use different target when testing, e.g.
//   cargo test --target x86_64-unknown-linux-gnu
#[cfg(test)]
#[macro_use]
extern crate std;

pub mod config;
pub mod coord;
pub mod input;
pub mod periph;
pub mod time;
pub mod transport;
pub mod utils;
pub mod wire;

#[cfg(test)]
mod sim;

/// Build metadata generated by `built`
pub mod build_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
pub extern crate bitcoin;

pub mod error;
pub mod exchange;
pub mod order;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod store;
pub mod utill;
pub mod wallet;
pub mod watcher;

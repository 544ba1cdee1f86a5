#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
extern crate bitcoin;

pub mod api;
pub mod config;
pub mod error;
pub mod esplora;
pub mod fee_estimation;
pub mod fees;
pub mod lightning;
pub mod nursery;
pub mod onchain;
pub mod protocol;
pub mod store;
pub mod swap;
pub mod utill;

//! Decision core for the organization's mail relay. Everything in this
//! crate is synchronous and network-free: the daemon feeds it one
//! envelope at a time and acts on the verdict.
//!
//! The interesting parts are [`alias`], which resolves recipient
//! expressions like `GFORM14` or `BESTFU-FUVE` against a directory
//! snapshot, [`report`], which reads the delivery reports our upstream
//! sends back, and [`pipeline`], which strings the checks together.

pub mod addr;
pub mod alias;
pub mod config;
pub mod directory;
pub mod envelope;
pub mod headers;
pub mod message;
pub mod pipeline;
pub mod report;

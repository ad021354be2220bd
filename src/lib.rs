//! Admission - per-identity admission control
//!
//! This crate decides, for each inbound request, whether the caller may
//! proceed under a rate policy. Counting happens in a shared Redis sorted-set
//! log so that every worker sees the same history, with an in-process
//! fixed-window counter taking over whenever the store is unreachable.

pub mod config;
pub mod error;
pub mod ratelimit;

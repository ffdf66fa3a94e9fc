//! # mutant-dispatch
//!
//! `mutant-dispatch` runs very large numbers of independent, possibly hanging
//! test-suite runs (one per mutant) across a bounded pool of out-of-process
//! workers, organized around:
//! - `dispatch::transport`: named FIFO queues (in-memory or spool directory)
//! - `dispatch::dispatcher`: inbound queue → worker pool → outbound queue, with a busy cap
//! - `dispatch::benchmark`: baseline measurement and benchmark-derived deadlines
//! - `dispatch::coordinator`: producer-side front end for a dispatcher process
//! - `logging`: `tracing` subscriber setup shared by every process mode
//!
//! Test execution itself is delegated to a [`dispatch::TestEngine`].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub mod dispatch;
pub mod logging;
pub mod prelude;

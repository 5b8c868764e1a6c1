// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pluggable routing strategies and request/response interceptors.
//!
//! The core does not decide where packets go; routers do, behind the
//! [`Router`]/[`RouterSession`] contract. Filters participate in both
//! directions of the pipeline and may short-circuit requests.

pub mod filter;
pub mod reply;
pub mod router;

pub use filter::{Filter, FilterContext, FilterSession};
pub use reply::{fnv1a_64, Reply, ReplyOutcome, ReplyRoute};
pub use router::{ErrorType, ReadConnRouter, Router, RouterSession};

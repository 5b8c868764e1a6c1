// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Filter contract.
//!
//! Filters intercept packets in both directions of the per-session
//! pipeline. A filter may short-circuit a request by setting a response:
//! the core then stops forwarding the current request downstream and
//! delivers the provided buffer upstream instead.

use super::reply::{Reply, ReplyRoute};
use crate::protocol::Packet;
use crate::Error;

/// Pipeline-side services available to a filter during a call.
#[derive(Debug, Default)]
pub struct FilterContext {
    response: Option<Packet>,
}

impl FilterContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Short-circuit the current request: `buffer` is delivered upstream
    /// and the request is not forwarded further downstream.
    pub fn set_response(&mut self, buffer: Packet) {
        self.response = Some(buffer);
    }

    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    pub(crate) fn take_response(&mut self) -> Option<Packet> {
        self.response.take()
    }
}

/// Factory for filter sessions; one instance per configured filter.
pub trait Filter: Send + Sync {
    fn make_session(&self) -> Result<Box<dyn FilterSession>, Error>;

    /// Module name for diagnostics and the admin surface.
    fn name(&self) -> &str;
}

/// Per-client filter state.
pub trait FilterSession: Send {
    /// Downstream interception. Returning `false` is fatal for the
    /// session.
    fn route_query(&mut self, ctx: &mut FilterContext, packet: &mut Packet) -> bool;

    /// Upstream interception. Returning `false` is fatal for the session.
    fn client_reply(
        &mut self,
        ctx: &mut FilterContext,
        packet: &mut Packet,
        route: &ReplyRoute,
        reply: &Reply,
    ) -> bool;
}

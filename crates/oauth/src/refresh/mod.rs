// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token refresh and credential exchange.

mod engine;
mod exchange;
mod flight;

pub use engine::{needs_refresh, normalize, EngineConfig, TokenRefreshEngine};
pub use exchange::{http_client, ExchangeError, TokenExchange};
pub use flight::FlightGroup;

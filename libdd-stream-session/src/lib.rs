// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod checkers;
pub mod manager;
pub mod token;

pub use checkers::CheckerSet;
pub use manager::{Session, SessionCounters, SessionManager, SessionSnapshot, UpsertOutcome};
pub use token::{ContextClass, TokenObservation};

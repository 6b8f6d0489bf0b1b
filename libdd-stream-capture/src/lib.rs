// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod engine;
pub mod pipeline;
pub mod ring;
pub mod sched;
pub mod source;
pub mod trace;

pub use engine::CaptureEngine;
pub use pipeline::Pipeline;
pub use ring::RingBuffer;
pub use source::{CaptureSource, ProcReader, ReadOutcome};
pub use trace::TraceReader;

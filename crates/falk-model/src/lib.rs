// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod engine;
mod error;
mod mock;
mod types;

pub use engine::{CancelFlag, ModelEngine, ResponseStream};
pub use error::EngineError;
pub use mock::{fenced_call_script, native_call_script, text_script, EchoEngine, ScriptedEngine};
pub use types::*;

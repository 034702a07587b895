// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Shared types.

use std::error::Error;
use std::fmt;
use std::rc::Rc;

use crate::traits::Runnable;

/// A task registered with the [`Engine`](crate::engine::Engine) and spawned
/// when the simulation starts.
pub type Component = Rc<dyn Runnable + 'static>;

#[macro_export]
/// Return a [SimError] built from anything that implements `to_string`.
macro_rules! sim_error {
    ($msg:expr) => {
        Err($crate::types::SimError($msg.to_string()))
    };
}

/// A failure that stops the simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct SimError(pub String);

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Error: {}", self.0)
    }
}

impl Error for SimError {}

pub type SimResult = Result<(), SimError>;

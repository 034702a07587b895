// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Simulation time: [clocks](clock), the overall [time owner](simtime) and
//! [timeouts](timeout) built on top of clock delays.

pub mod clock;
pub mod simtime;
pub mod timeout;

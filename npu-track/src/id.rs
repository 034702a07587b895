// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Identifiers of tracked entities and objects.

use std::fmt;

/// Identifies an entity or a tracked object (such as a pool buffer) in
/// _log_/_trace_ output. [`NO_ID`](crate::NO_ID) and [`ROOT`](crate::ROOT)
/// are reserved.
#[derive(Copy, Clone, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Id(pub u64);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

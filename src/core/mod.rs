// Domain-layer modules and shared errors
pub mod assignment {
    pub use crate::assignment::*;
}

pub mod capacity {
    pub use crate::capacity::*;
}

pub mod scheduler {
    pub use crate::scheduler::*;
}

pub mod status_rules {
    pub use crate::status_rules::*;
}

pub mod errors {
    pub use crate::errors::*;
}

//! Persistence: pool setup, row models and the storage services.

pub mod db {
    pub use crate::db::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod assignment_storage {
    pub use crate::assignment_storage::*;
}

pub mod audit {
    pub use crate::audit::*;
}

pub mod calendar {
    pub use crate::calendar::*;
}

pub mod status_service {
    pub use crate::status_service::*;
}

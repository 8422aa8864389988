// Thin namespace wrapper for API-layer components
pub mod handlers {
    pub use crate::handlers::*;
}

pub mod cron_handler {
    pub use crate::cron_handler::*;
}

pub mod playbook_handler {
    pub use crate::playbook_handler::*;
}

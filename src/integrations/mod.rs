//! External service integrations.

pub mod playbook_client {
    pub use crate::playbook_client::*;
}

pub mod playbook_sync {
    pub use crate::playbook_sync::*;
}

pub mod webhook_client {
    pub use crate::webhook_client::*;
}

pub mod derive;

pub use derive::{
    default_disconnect_timeout, derive_device_status, format_duration, Derivation, StatusUpdate,
};

#[cfg(test)]
mod tests;

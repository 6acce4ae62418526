#![forbid(unsafe_code)]

pub mod broadcast_hub;
pub mod channel_state;
pub mod health;
pub mod link;
pub mod monitor;
pub mod poller;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_support;




#[cfg(test)]
mod registry_tests;

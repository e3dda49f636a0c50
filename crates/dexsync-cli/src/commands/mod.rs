pub mod common;
pub mod edit;
pub mod reset;
pub mod status;
pub mod watch;

pub mod capable;
pub mod cgroup;
pub mod config;
pub mod fdpass;
pub mod helper;
pub mod idmap;
pub mod net;
pub mod nspersist;
pub mod tty;

pub use config::SandboxConfig;
pub use helper::{HelperConfig, OuterHelper};

pub mod backup;
pub mod config;
pub mod dispatch;
pub mod ipc;
pub mod lock;
pub mod preflight;
pub mod profile;
pub mod relay;
pub mod runtime;
pub mod status;
pub mod upgrade;

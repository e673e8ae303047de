mod config;
mod factory;
mod image;
mod prerequisites;
mod sandbox;
mod stats;

pub use config::DockerConfig;
pub use factory::{DockerFactory, connect};
pub use self::sandbox::DockerSandbox;

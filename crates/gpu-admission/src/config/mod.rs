pub mod cli;
pub mod extender;

pub use cli::Cli;
pub use extender::ExtenderConfig;

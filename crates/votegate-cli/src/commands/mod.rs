use std::any::Any;
use std::process::ExitCode;

use crate::cli::{Commands, OutputMode};
use crate::config::ConfigLocation;
use crate::errors::AppResult;

pub trait CommandHandler: Send + Sync {
    fn execute(&self, mode: OutputMode, verbose: bool) -> AppResult<ExitCode>;
    fn as_any(&self) -> &dyn Any;
}

mod audit;
mod doctor;
mod enroll;
mod keyring;
mod revoke;
mod status;
mod token;
mod verify;

pub use audit::AuditHandler;
pub use doctor::DoctorHandler;
pub use enroll::EnrollHandler;
pub use keyring::KeyringHandler;
pub use revoke::RevokeHandler;
pub use status::StatusHandler;
pub use token::{TokenHandler, TokenHandlerDeps};
pub use verify::VerifyHandler;

/// Builds the handler for `command`, reading configuration from `config`
/// when given.
pub fn dispatch(command: Commands, config: ConfigLocation) -> Box<dyn CommandHandler> {
    match command {
        Commands::Enroll(args) => Box::new(EnrollHandler::new(args, config)),
        Commands::Verify(args) => Box::new(VerifyHandler::new(args, config)),
        Commands::Status(args) => Box::new(StatusHandler::new(args, config)),
        Commands::Revoke(args) => Box::new(RevokeHandler::new(args, config)),
        Commands::Token(cmd) => Box::new(TokenHandler::new(cmd, config)),
        Commands::Audit(args) => Box::new(AuditHandler::new(args, config)),
        Commands::Keyring(cmd) => Box::new(KeyringHandler::new(cmd)),
        Commands::Doctor => Box::new(DoctorHandler::new(config)),
    }
}

impl From<Commands> for Box<dyn CommandHandler> {
    fn from(command: Commands) -> Self {
        dispatch(command, None)
    }
}

use std::any::Any;
use std::process::ExitCode;

use crate::cli::{OutputMode, TokenArgs, TokenCommands};
use crate::commands::CommandHandler;
use crate::config::ConfigLocation;
use crate::errors::AppResult;
use crate::operations::{self, ExpiryReport, TokenReport};
use crate::output::{render_expiry, render_token};

pub struct TokenHandler {
    command: TokenCommands,
    deps: TokenHandlerDeps,
}

pub struct TokenHandlerDeps {
    pub validate: Box<dyn Fn(&TokenArgs) -> AppResult<TokenReport> + Send + Sync>,
    pub expiry: Box<dyn Fn(&TokenArgs) -> AppResult<ExpiryReport> + Send + Sync>,
    pub render_validate: Box<dyn Fn(&TokenReport, OutputMode) -> AppResult<()> + Send + Sync>,
    pub render_expiry: Box<dyn Fn(&ExpiryReport, OutputMode) -> AppResult<()> + Send + Sync>,
}

impl TokenHandlerDeps {
    pub fn new(
        validate: impl Fn(&TokenArgs) -> AppResult<TokenReport> + Send + Sync + 'static,
        expiry: impl Fn(&TokenArgs) -> AppResult<ExpiryReport> + Send + Sync + 'static,
        render_validate: impl Fn(&TokenReport, OutputMode) -> AppResult<()> + Send + Sync + 'static,
        render_expiry: impl Fn(&ExpiryReport, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            validate: Box::new(validate),
            expiry: Box::new(expiry),
            render_validate: Box::new(render_validate),
            render_expiry: Box::new(render_expiry),
        }
    }

    fn for_location(config: ConfigLocation) -> Self {
        Self::new(
            move |args| operations::run_token_validate(args, config.as_deref()),
            operations::run_token_expiry,
            render_token,
            render_expiry,
        )
    }
}

impl TokenHandler {
    pub fn new(command: TokenCommands, config: ConfigLocation) -> Self {
        Self::with_dependencies(command, TokenHandlerDeps::for_location(config))
    }

    pub fn with_dependencies(command: TokenCommands, deps: TokenHandlerDeps) -> Self {
        Self { command, deps }
    }
}

impl CommandHandler for TokenHandler {
    fn execute(&self, mode: OutputMode, _verbose: bool) -> AppResult<ExitCode> {
        match &self.command {
            TokenCommands::Validate(args) => {
                let report = (self.deps.validate)(args)?;
                (self.deps.render_validate)(&report, mode)?;
                Ok(if report.valid {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::from(1)
                })
            }
            TokenCommands::Expiry(args) => {
                let report = (self.deps.expiry)(args)?;
                (self.deps.render_expiry)(&report, mode)?;
                Ok(ExitCode::SUCCESS)
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

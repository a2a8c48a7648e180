use std::any::Any;
use std::process::ExitCode;

use votegate_core::decision::VerifyOutcome;

use crate::cli::{OutputMode, VerifyArgs};
use crate::commands::CommandHandler;
use crate::config::ConfigLocation;
use crate::errors::AppResult;
use crate::operations;
use crate::output::render_verify;

pub struct VerifyHandler {
    args: VerifyArgs,
    run: Box<dyn Fn(&VerifyArgs) -> AppResult<VerifyOutcome> + Send + Sync>,
    render: Box<dyn Fn(&VerifyOutcome, OutputMode, bool) -> AppResult<()> + Send + Sync>,
}

impl VerifyHandler {
    pub fn new(args: VerifyArgs, config: ConfigLocation) -> Self {
        Self::with_dependencies(
            args,
            move |args| operations::run_verify(args, config.as_deref()),
            render_verify,
        )
    }

    pub fn with_dependencies(
        args: VerifyArgs,
        run: impl Fn(&VerifyArgs) -> AppResult<VerifyOutcome> + Send + Sync + 'static,
        render: impl Fn(&VerifyOutcome, OutputMode, bool) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            args,
            run: Box::new(run),
            render: Box::new(render),
        }
    }
}

impl CommandHandler for VerifyHandler {
    fn execute(&self, mode: OutputMode, verbose: bool) -> AppResult<ExitCode> {
        let outcome = (self.run)(&self.args)?;
        (self.render)(&outcome, mode, verbose)?;
        // Rejections render normally but exit 1.
        let exit = if outcome.verified {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(1)
        };
        Ok(exit)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

use std::any::Any;
use std::process::ExitCode;

use crate::cli::{IdentityArgs, OutputMode};
use crate::commands::CommandHandler;
use crate::config::ConfigLocation;
use crate::errors::AppResult;
use crate::operations::{self, RevokeOutcome};
use crate::output::render_revoke;

pub struct RevokeHandler {
    args: IdentityArgs,
    run: Box<dyn Fn(&IdentityArgs) -> AppResult<RevokeOutcome> + Send + Sync>,
    render: Box<dyn Fn(&RevokeOutcome, OutputMode) -> AppResult<()> + Send + Sync>,
}

impl RevokeHandler {
    pub fn new(args: IdentityArgs, config: ConfigLocation) -> Self {
        Self::with_dependencies(
            args,
            move |args| operations::run_revoke(args, config.as_deref()),
            render_revoke,
        )
    }

    pub fn with_dependencies(
        args: IdentityArgs,
        run: impl Fn(&IdentityArgs) -> AppResult<RevokeOutcome> + Send + Sync + 'static,
        render: impl Fn(&RevokeOutcome, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            args,
            run: Box::new(run),
            render: Box::new(render),
        }
    }
}

impl CommandHandler for RevokeHandler {
    fn execute(&self, mode: OutputMode, _verbose: bool) -> AppResult<ExitCode> {
        let outcome = (self.run)(&self.args)?;
        (self.render)(&outcome, mode)?;
        Ok(ExitCode::SUCCESS)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

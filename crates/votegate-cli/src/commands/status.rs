use std::any::Any;
use std::process::ExitCode;

use votegate_core::StatusReport;

use crate::cli::{IdentityArgs, OutputMode};
use crate::commands::CommandHandler;
use crate::config::ConfigLocation;
use crate::errors::AppResult;
use crate::operations;
use crate::output::render_status;

pub struct StatusHandler {
    args: IdentityArgs,
    run: Box<dyn Fn(&IdentityArgs) -> AppResult<StatusReport> + Send + Sync>,
    render: Box<dyn Fn(&StatusReport, OutputMode) -> AppResult<()> + Send + Sync>,
}

impl StatusHandler {
    pub fn new(args: IdentityArgs, config: ConfigLocation) -> Self {
        Self::with_dependencies(
            args,
            move |args| operations::run_status(args, config.as_deref()),
            render_status,
        )
    }

    pub fn with_dependencies(
        args: IdentityArgs,
        run: impl Fn(&IdentityArgs) -> AppResult<StatusReport> + Send + Sync + 'static,
        render: impl Fn(&StatusReport, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            args,
            run: Box::new(run),
            render: Box::new(render),
        }
    }
}

impl CommandHandler for StatusHandler {
    fn execute(&self, mode: OutputMode, _verbose: bool) -> AppResult<ExitCode> {
        let report = (self.run)(&self.args)?;
        (self.render)(&report, mode)?;
        Ok(ExitCode::SUCCESS)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

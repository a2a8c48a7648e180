use std::any::Any;
use std::process::ExitCode;

use crate::cli::{AuditArgs, OutputMode};
use crate::commands::CommandHandler;
use crate::config::ConfigLocation;
use crate::errors::AppResult;
use crate::operations::{self, AuditReport};
use crate::output::render_audit;

pub struct AuditHandler {
    args: AuditArgs,
    run: Box<dyn Fn(&AuditArgs) -> AppResult<AuditReport> + Send + Sync>,
    render: Box<dyn Fn(&AuditReport, OutputMode) -> AppResult<()> + Send + Sync>,
}

impl AuditHandler {
    pub fn new(args: AuditArgs, config: ConfigLocation) -> Self {
        Self::with_dependencies(
            args,
            move |args| operations::run_audit(args, config.as_deref()),
            render_audit,
        )
    }

    pub fn with_dependencies(
        args: AuditArgs,
        run: impl Fn(&AuditArgs) -> AppResult<AuditReport> + Send + Sync + 'static,
        render: impl Fn(&AuditReport, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            args,
            run: Box::new(run),
            render: Box::new(render),
        }
    }
}

impl CommandHandler for AuditHandler {
    fn execute(&self, mode: OutputMode, _verbose: bool) -> AppResult<ExitCode> {
        let report = (self.run)(&self.args)?;
        (self.render)(&report, mode)?;
        Ok(ExitCode::SUCCESS)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

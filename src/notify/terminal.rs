use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::NotifyError;
use crate::model::PipelineEvent;
use crate::notify::{NotifyChannel, Verbosity, format_detailed, format_simple};

/// Plain stdout sink for operators running in a terminal.
pub struct TerminalChannel;

impl NotifyChannel for TerminalChannel {
    fn name(&self) -> &str {
        "terminal"
    }

    fn format(&self, event: &PipelineEvent, verbosity: Verbosity) -> String {
        match verbosity {
            Verbosity::Simple => format_simple(event),
            Verbosity::Detailed => format_detailed(event),
        }
    }

    fn deliver(&self, payload: &str) -> BoxFuture<'_, Result<(), Report<NotifyError>>> {
        let line = payload.to_owned();
        Box::pin(async move {
            println!("{line}");
            Ok(())
        })
    }
}

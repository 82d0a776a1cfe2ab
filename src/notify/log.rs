use error_stack::Report;
use futures::future::BoxFuture;
use tracing::info;

use crate::error::NotifyError;
use crate::model::PipelineEvent;
use crate::notify::{NotifyChannel, Verbosity, format_detailed, format_simple};

/// Structured-log sink: notifications become tracing events that ride the
/// process's normal log pipeline (text or JSON per config).
pub struct LogChannel;

impl NotifyChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
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
            info!(target: "notification", "{line}");
            Ok(())
        })
    }
}

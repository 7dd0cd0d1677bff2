//! Fire-and-forget image-description enrichment (§4.4 "Vision pipeline").
//!
//! For each image attachment, a background task fetches recent conversation
//! context, calls the vision analyzer with a bounded timeout, and on
//! success injects the description back into the owning session as a
//! second, tagged prompt. Failure is silent — logged, never surfaced to the
//! conversation.

use std::sync::Arc;
use std::time::Duration;

use sa_domain::chat_id::ChatId;
use sa_domain::message::Attachment;
use sa_domain::trace::TraceEvent;

use crate::interfaces::VisionAnalyzer;

const VISION_TAG: &str = "[vision-enrichment]";

/// Spawn the enrichment task. `inject` is a callback (typically
/// `Orchestrator::inject_message` bound to this chat_id) so this module
/// never depends on the orchestrator's concrete type.
pub fn enrich_async<F>(
    analyzer: Arc<dyn VisionAnalyzer>,
    chat_id: ChatId,
    attachment: Attachment,
    context_prompt: String,
    timeout: Duration,
    inject: F,
) where
    F: FnOnce(String) + Send + 'static,
{
    if !attachment.is_image() {
        return;
    }

    tokio::spawn(async move {
        let result = tokio::time::timeout(
            timeout,
            analyzer.describe(&attachment.path, &context_prompt),
        )
        .await;

        match result {
            Ok(Ok(description)) => {
                inject(format!("{VISION_TAG} {description}"));
            }
            Ok(Err(e)) => {
                TraceEvent::VisionEnrichmentFailed {
                    chat_id: chat_id.as_str().to_string(),
                    reason: e.to_string(),
                }
                .emit();
            }
            Err(_) => {
                TraceEvent::VisionEnrichmentFailed {
                    chat_id: chat_id.as_str().to_string(),
                    reason: "timed out".into(),
                }
                .emit();
            }
        }
    });
}

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    extract::Extension,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};
use tracing::warn;

use crate::app::services::AppServices;

/// `GET /jobs/events`: one `job.completed` event per terminal run.
///
/// Lagging subscribers silently skip what they missed.
pub async fn stream(
    Extension(services): Extension<Arc<AppServices>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = services.jobs.notifier.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|msg| {
        let completion = msg.ok()?;
        match SseEvent::default().event("job.completed").json_data(&completion) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                warn!(job_id = %completion.job_id, error = %e, "failed to encode completion");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use qsim_core::types::JobId;
use qsim_engine::{DispatchMode, JobService};
use qsim_events::{ProgressEvent, ProgressSubscription};

use crate::error::AppResult;
use crate::handlers::simulations::parse_job_id;
use crate::state::AppState;

/// How often a queue-mode stream re-reads the job record. Jobs run by a
/// separate worker process publish nothing to this process's hub.
const RECORD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// GET /api/v1/simulations/{id}/stream
///
/// Resolves the subscription before upgrading so unknown jobs get a
/// plain 404 response.
pub async fn progress_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let job_id = parse_job_id(&raw_id)?;
    let subscription = state.jobs.subscribe(job_id).await?;
    let jobs = state.jobs.clone();
    Ok(ws.on_upgrade(move |socket| stream_progress(socket, subscription, jobs)))
}

/// Forward events to the socket until the stream ends or the client leaves.
async fn stream_progress(socket: WebSocket, mut subscription: ProgressSubscription, jobs: JobService) {
    let job_id = subscription.job_id();
    tracing::info!(job_id = %job_id, "Progress stream connected");

    let (mut sink, mut stream) = socket.split();
    let poll_record = jobs.manager().dispatch_mode() == DispatchMode::Queue;
    let mut ticker = tokio::time::interval(RECORD_POLL_INTERVAL);
    let mut last_progress: i16 = -1;

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                if let ProgressEvent::Progress { progress, .. } = &event {
                    last_progress = last_progress.max(*progress);
                }
                if !send_event(&mut sink, job_id, &event).await {
                    break;
                }
            }
            _ = ticker.tick(), if poll_record => {
                let job = match jobs.get(job_id).await {
                    Ok(job) => job,
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Failed to poll job record");
                        continue;
                    }
                };
                if let Some(terminal) = ProgressEvent::terminal_for(&job) {
                    if send_event(&mut sink, job_id, &terminal).await {
                        let _ = sink.send(Message::Close(None)).await;
                    }
                    break;
                }
                if job.progress > last_progress {
                    last_progress = job.progress;
                    let event = ProgressEvent::progress(job_id, job.progress, job.current_step, None);
                    if !send_event(&mut sink, job_id, &event).await {
                        break;
                    }
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(job_id = %job_id, error = %e, "Progress stream receive error");
                    break;
                }
            },
        }
    }

    drop(subscription);
    jobs.manager().hub().prune_idle(job_id);
    tracing::info!(job_id = %job_id, "Progress stream disconnected");
}

/// Encode and send one event. Returns `false` once the socket is gone.
async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    job_id: JobId,
    event: &ProgressEvent,
) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to encode progress event");
            return true;
        }
    };
    if sink.send(Message::Text(text.into())).await.is_err() {
        tracing::debug!(job_id = %job_id, "Progress stream sink closed");
        return false;
    }
    true
}

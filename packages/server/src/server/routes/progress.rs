//! Server-sent-events progress stream.
//!
//! On subscribe the latest snapshot is pushed first, then live events as
//! they are published. A terminal event is emitted as an `event: complete`
//! frame and the stream closes; 30 seconds of silence produces a heartbeat
//! frame so intermediaries keep the connection open.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Extension, Path};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tracing::debug;

use crate::kernel::progress::ProgressEvent;
use crate::server::app::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

struct LiveState {
    rx: broadcast::Receiver<ProgressEvent>,
    job_id: i64,
    done: bool,
}

pub async fn job_progress(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<i64>,
) -> impl IntoResponse {
    let (snapshot, rx) = state.runtime.progress.subscribe(job_id).await;

    let initial = stream::iter(
        snapshot
            .into_iter()
            .map(|event| Ok::<_, Infallible>(data_frame(&event))),
    );

    let live = stream::unfold(
        LiveState {
            rx,
            job_id,
            done: false,
        },
        |mut st| async move {
            if st.done {
                return None;
            }
            loop {
                match tokio::time::timeout(HEARTBEAT_INTERVAL, st.rx.recv()).await {
                    // Idle: keep the connection alive.
                    Err(_) => {
                        let heartbeat = serde_json::json!({
                            "type": "heartbeat",
                            "timestamp": chrono::Utc::now().timestamp(),
                        });
                        return Some((
                            Ok::<_, Infallible>(Event::default().data(heartbeat.to_string())),
                            st,
                        ));
                    }
                    Ok(Ok(event)) if event.is_terminal() => {
                        st.done = true;
                        return Some((Ok(complete_frame(&event)), st));
                    }
                    Ok(Ok(event)) => return Some((Ok(data_frame(&event)), st)),
                    Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                        debug!(
                            job_id = st.job_id,
                            missed, "slow progress subscriber dropped events"
                        );
                        continue;
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                }
            }
        },
    );

    Sse::new(initial.chain(live))
}

fn data_frame(event: &ProgressEvent) -> Event {
    Event::default().data(encode(event))
}

fn complete_frame(event: &ProgressEvent) -> Event {
    Event::default().event("complete").data(encode(event))
}

fn encode(event: &ProgressEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string())
}

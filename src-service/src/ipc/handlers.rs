//! IPC request handlers.

use std::sync::Arc;

use subtext_common::ipc::{Request, Response, ServiceStatus};
use tracing::{error, info};

use crate::engine::model_catalog;
use crate::pipeline::{self, ServiceState};
use crate::scheduler::CancelFlag;

/// Handle an IPC request and return a response.
pub async fn handle_request(state: Arc<ServiceState>, request: Request) -> Response {
    match request {
        Request::Transcribe { request } => {
            info!(
                "Transcribe: source={} model={} parallel={}",
                request.source, request.model, request.parallel
            );
            // Cancellation is cooperative at unit boundaries; a
            // disconnecting client simply never reads the response.
            let cancel = CancelFlag::new();
            match pipeline::transcribe(&state, request, &cancel).await {
                Ok(outcome) => Response::Outcome { outcome },
                Err(e) => {
                    error!("Transcription failed: {}", e);
                    Response::error(e)
                }
            }
        }

        Request::Status => {
            let status = ServiceStatus {
                active_sessions: state.admission.active_sessions(),
                max_sessions: state.admission.max_sessions(),
                cached_engines: state.admission.cached_engine_keys(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            };
            Response::Status { status }
        }

        Request::ListModels => Response::Models {
            models: model_catalog(),
        },
    }
}

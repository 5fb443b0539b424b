use crate::state::AppState;
use actix_web::{get, web, HttpResponse};
use capture::reconcile::phase::SequencerPhase;
use serde::Serialize;

#[derive(Serialize, Debug)]
struct IndexResponse {
    version: &'static str,
    capture: String,
    healthy: bool,
}

/// Liveness: unhealthy once the capture has stopped.
#[get("/")]
pub async fn index(state: web::Data<AppState>) -> HttpResponse {
    let healthy = *state.phase.borrow() != SequencerPhase::Stopped;
    let resp = IndexResponse {
        version: env!("CARGO_PKG_VERSION"),
        capture: state.name.clone(),
        healthy,
    };
    if healthy {
        HttpResponse::Ok().json(resp)
    } else {
        HttpResponse::ServiceUnavailable().json(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use capture::checkpoint::Checkpoint;
    use tokio::sync::watch;

    async fn status_for(phase: SequencerPhase) -> StatusCode {
        let (_phase_tx, phase) = watch::channel(phase);
        let (_progress_tx, progress) = watch::channel(Checkpoint::default());
        let state = web::Data::new(AppState {
            name: "shop".to_string(),
            phase,
            progress,
        });
        let app = test::init_service(App::new().app_data(state).service(index)).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        resp.status()
    }

    #[actix_web::test]
    async fn test_index_reports_liveness() {
        assert_eq!(status_for(SequencerPhase::Streaming).await, StatusCode::OK);
        assert_eq!(
            status_for(SequencerPhase::Stopped).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}

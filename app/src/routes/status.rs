use crate::state::AppState;
use actix_web::{get, web, HttpResponse};
use capture::checkpoint::Checkpoint;
use capture::reconcile::phase::SequencerPhase;
use serde::Serialize;

#[derive(Serialize, Debug)]
struct StatusResponse {
    name: String,
    phase: SequencerPhase,
    checkpoint: Checkpoint,
}

#[get("/status")]
pub async fn status(state: web::Data<AppState>) -> HttpResponse {
    let resp = StatusResponse {
        name: state.name.clone(),
        phase: *state.phase.borrow(),
        checkpoint: state.progress.borrow().clone(),
    };
    HttpResponse::Ok().json(resp)
}

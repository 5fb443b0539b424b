use capture::checkpoint::Checkpoint;
use capture::reconcile::phase::SequencerPhase;
use tokio::sync::watch;

pub struct AppState {
    pub name: String,
    pub phase: watch::Receiver<SequencerPhase>,
    pub progress: watch::Receiver<Checkpoint>,
}

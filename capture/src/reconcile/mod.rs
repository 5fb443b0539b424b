pub mod phase;
pub mod sequencer;
pub mod table;

mod state;

pub use state::{JoinRequest, Participant, RoomPhase, RoomSession};
